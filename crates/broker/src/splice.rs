use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dial::BoxedStream;
use crate::instance::InstanceName;

const COPY_BUF_SIZE: usize = 8 * 1024;

/// Ferry bytes between a client stream and its remote counterpart until
/// either direction sees end-of-stream or an I/O error. The first
/// terminating event tears both streams down; whatever the other
/// direction observes afterwards is suppressed.
#[tracing::instrument(level = "debug", skip_all, fields(instance = %instance))]
pub async fn splice(instance: &InstanceName, client: BoxedStream, remote: BoxedStream) {
    let (client_r, client_w) = tokio::io::split(client);
    let (remote_r, remote_w) = tokio::io::split(remote);

    let client_to_remote = copy_direction(instance, "tx", client_r, remote_w);
    let remote_to_client = copy_direction(instance, "rx", remote_r, client_w);
    tokio::pin!(client_to_remote, remote_to_client);

    // Whichever direction terminates first decides the outcome; the other
    // direction's halves are dropped with its future, closing both streams.
    let (direction, copied, result) = tokio::select! {
        (copied, result) = &mut client_to_remote => ("client to instance", copied, result),
        (copied, result) = &mut remote_to_client => ("instance to client", copied, result),
    };

    match result {
        Ok(()) => {
            tracing::info!(instance = %instance, direction, copied, "connection closed");
        }
        Err(err) => {
            tracing::error!(instance = %instance, direction, copied, %err, "connection aborted");
        }
    }
}

/// Copy one direction, preserving write order of reads, and account bytes
/// as they move so a torn-down peer direction still reports its traffic.
async fn copy_direction<R, W>(
    instance: &InstanceName,
    direction: &'static str,
    mut reader: R,
    mut writer: W,
) -> (u64, std::io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut copied = 0u64;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return (copied, Ok(()));
            }
            Ok(n) => {
                if let Err(err) = writer.write_all(&buf[..n]).await {
                    return (copied, Err(err));
                }
                copied += n as u64;
                metrics::counter!(
                    "csql_proxy_bytes_copied_total",
                    "instance" => instance.to_string(),
                    "direction" => direction
                )
                .increment(n as u64);
            }
            Err(err) => return (copied, Err(err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::duplex;

    fn inst() -> InstanceName {
        "proj:region:inst".parse().unwrap()
    }

    #[tokio::test]
    async fn copies_both_directions() {
        let (client_near, client_far) = duplex(64);
        let (remote_near, remote_far) = duplex(64);

        let task = tokio::spawn(async move {
            splice(&inst(), Box::new(client_far), Box::new(remote_near)).await;
        });

        let (mut client_r, mut client_w) = tokio::io::split(client_near);
        let (mut remote_r, mut remote_w) = tokio::io::split(remote_far);

        client_w.write_all(b"query").await.unwrap();
        let mut buf = [0u8; 5];
        remote_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"query");

        remote_w.write_all(b"rows").await.unwrap();
        let mut buf = [0u8; 4];
        client_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"rows");

        // Client hangs up; the splice tears down and the remote observes
        // end-of-stream.
        drop(client_w);
        drop(client_r);
        task.await.unwrap();

        let mut rest = Vec::new();
        remote_r.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn remote_close_tears_down_client() {
        let (client_near, client_far) = duplex(64);
        let (remote_near, remote_far) = duplex(64);

        let task = tokio::spawn(async move {
            splice(&inst(), Box::new(client_far), Box::new(remote_near)).await;
        });

        drop(remote_far);

        let (mut client_r, _client_w) = tokio::io::split(client_near);
        let mut rest = Vec::new();
        client_r.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        task.await.unwrap();
    }

    #[tokio::test]
    async fn preserves_order_within_a_direction() {
        let (client_near, client_far) = duplex(8);
        let (remote_near, remote_far) = duplex(8);

        let task = tokio::spawn(async move {
            splice(&inst(), Box::new(client_far), Box::new(remote_near)).await;
        });

        let (_client_r, mut client_w) = tokio::io::split(client_near);
        let (mut remote_r, _remote_w) = tokio::io::split(remote_far);

        let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        let expect = payload.clone();

        let writer = tokio::spawn(async move {
            client_w.write_all(&payload).await.unwrap();
            client_w.shutdown().await.unwrap();
            client_w
        });

        let mut got = vec![0u8; expect.len()];
        remote_r.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expect);

        drop(writer.await.unwrap());
        task.await.unwrap();
    }
}
