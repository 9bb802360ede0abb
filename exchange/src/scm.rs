//! `SCM_RIGHTS` send and receive on top of tokio's `UnixStream`.
//!
//! Both directions go through `UnixStream::async_io` so readiness is driven by
//! the runtime while the actual `sendmsg`/`recvmsg` calls stay in nix.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::error::ExchangeError;
use crate::protocol::MAX_HANDLES;

/// Send `payload` with `fds` attached as a single message.
pub async fn send_with_fds(
    stream: &UnixStream,
    payload: &[u8],
    fds: &[RawFd],
) -> Result<usize, ExchangeError> {
    let raw = stream.as_raw_fd();
    let sent = stream
        .async_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(payload)];
            let cmsgs = [ControlMessage::ScmRights(fds)];
            let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &cmsgs };
            sendmsg::<()>(raw, &iov, cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
        })
        .await?;
    Ok(sent)
}

/// Receive one message into `buf`, returning the byte count and every
/// descriptor carried in its control part.
///
/// Received descriptors are marked close-on-exec. A control message that did
/// not fit the buffer is an error; whatever descriptors did arrive are closed
/// when the returned vector is dropped.
pub async fn recv_with_fds(
    stream: &UnixStream,
    buf: &mut [u8],
) -> Result<(usize, Vec<OwnedFd>), ExchangeError> {
    let raw = stream.as_raw_fd();
    let (bytes, truncated, fds) = stream
        .async_io(Interest::READABLE, || {
            let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_HANDLES]);
            let mut iov = [IoSliceMut::new(buf)];
            let msg = recvmsg::<()>(
                raw,
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(io::Error::from)?;

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    // SAFETY: the kernel just installed these descriptors in
                    // our table and nothing else refers to them yet.
                    fds.extend(received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
            }
            let truncated = msg.flags.contains(MsgFlags::MSG_CTRUNC);
            Ok((msg.bytes, truncated, fds))
        })
        .await?;

    if truncated {
        return Err(ExchangeError::ControlTruncated(MAX_HANDLES));
    }
    Ok((bytes, fds))
}
