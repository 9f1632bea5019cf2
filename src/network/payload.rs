//! Out-of-band payload transfer: moving the raw bytes that accompany a
//! packet carrying `payloadSize`/`payloadTransferInfo`, once the main
//! channel's subchannel handshake (see [`crate::network::channel::Channel`])
//! has been completed and the peer certificate pinned to it.
//!
//! The core moves bytes, not files: callers above this crate (the `share`
//! plugin and friends, out of scope per `spec.md` §1) own the filesystem
//! side of a transfer. This mirrors how the teacher's sibling payload
//! modules separate `PayloadServer`/`PayloadClient` (socket plumbing) from
//! `FileTransferInfo` (filesystem metadata) -- only the former has a
//! counterpart in this core.

use crate::crypto::IdentityStore;
use crate::error::Result;
use crate::network::channel::Channel;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Write the whole buffer to `stream` and shut it down. Mirrors the
/// teacher's `PayloadServer::send_file` loop, collapsed to an in-memory
/// buffer since the core has no file-I/O concerns of its own.
async fn write_payload<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> Result<()> {
    stream.write_all(data).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read `size` bytes from `stream`, or until EOF if `size < 0` (spec 4.3:
/// "reads exactly `S` bytes (or until EOF if `S == -1`)").
async fn read_payload<S: AsyncRead + Unpin>(stream: &mut S, size: i64) -> Result<Vec<u8>> {
    if size < 0 {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        Ok(buf)
    } else {
        let mut buf = vec![0u8; size as usize];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Begin an upload: bind a listener in the LAN payload range, return its
/// port immediately (so the caller can attach it to the packet it's about
/// to send), and hand back a task that completes once a peer connects,
/// authenticates, and receives `data`.
///
/// The returned port must be attached to the announcing packet's
/// `payloadTransferInfo.port` (see [`crate::protocol::packet::Packet::with_payload`])
/// before the caller awaits the join handle -- the peer has nothing to
/// connect to until that packet is sent.
pub async fn upload(
    identity: Arc<IdentityStore>,
    main_channel_peer_cert: Vec<u8>,
    data: Vec<u8>,
) -> Result<(u16, JoinHandle<Result<u64>>)> {
    let (listener, port) = Channel::open_upload_subchannel().await?;
    let handle = tokio::spawn(async move {
        let mut tls = Channel::accept_upload(listener, &identity, &main_channel_peer_cert).await?;
        write_payload(&mut tls, &data).await?;
        Ok(data.len() as u64)
    });
    Ok((port, handle))
}

/// Connect to a peer-advertised payload port, authenticate it against
/// `main_channel_peer_cert`, and read exactly `size` bytes (or until EOF
/// if `size == -1`).
pub async fn download(
    peer_ip: IpAddr,
    port: u16,
    identity: &IdentityStore,
    main_channel_peer_cert: &[u8],
    size: i64,
) -> Result<Vec<u8>> {
    let mut tls = Channel::connect_download(peer_ip, port, identity, main_channel_peer_cert).await?;
    read_payload(&mut tls, size).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn upload_download_round_trip_with_known_size() {
        let sender = Arc::new(IdentityStore::generate("sender-dev").unwrap());
        let receiver = IdentityStore::generate("receiver-dev").unwrap();
        let receiver_cert = receiver.cert_der().to_vec();
        let sender_cert = sender.cert_der().to_vec();

        let data = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let (port, upload_task) = upload(sender.clone(), receiver_cert, data.clone())
            .await
            .unwrap();

        let downloaded = download(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            &receiver,
            &sender_cert,
            data.len() as i64,
        )
        .await
        .unwrap();

        upload_task.await.unwrap().unwrap();
        assert_eq!(downloaded, data);
    }

    #[tokio::test]
    async fn upload_download_round_trip_with_unknown_size_reads_to_eof() {
        let sender = Arc::new(IdentityStore::generate("sender-dev-2").unwrap());
        let receiver = IdentityStore::generate("receiver-dev-2").unwrap();
        let receiver_cert = receiver.cert_der().to_vec();
        let sender_cert = sender.cert_der().to_vec();

        let data = b"arbitrary length payload, no declared size".to_vec();
        let (port, upload_task) = upload(sender.clone(), receiver_cert, data.clone())
            .await
            .unwrap();

        let downloaded = download(IpAddr::V4(Ipv4Addr::LOCALHOST), port, &receiver, &sender_cert, -1)
            .await
            .unwrap();

        upload_task.await.unwrap().unwrap();
        assert_eq!(downloaded, data);
    }

    #[tokio::test]
    async fn download_rejects_mismatched_peer_certificate() {
        let sender = Arc::new(IdentityStore::generate("sender-dev-3").unwrap());
        let receiver = IdentityStore::generate("receiver-dev-3").unwrap();
        let impostor_cert = IdentityStore::generate("impostor").unwrap().cert_der().to_vec();
        let receiver_cert = receiver.cert_der().to_vec();

        let (port, upload_task) = upload(sender.clone(), receiver_cert, vec![0u8; 4])
            .await
            .unwrap();

        let result = download(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            &receiver,
            &impostor_cert,
            4,
        )
        .await;
        assert!(result.is_err());
        let _ = upload_task.await;
    }
}
