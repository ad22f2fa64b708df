//! The privileged process: reads requests, applies them to the kernel,
//! and cleans up after itself when the client goes away.

use super::message::{FrameReader, PrivRequest};
use crate::network::kernel::Kernel;
use std::{ffi::OsString, io, net::Ipv4Addr, os::unix::process::CommandExt, process::Command};
use tokio::{
    io::AsyncReadExt,
    net::UnixStream,
    signal::unix::{signal, SignalKind},
};

/// Why the request loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// SIGTERM, here or in the client: leave the interface configured.
    Terminate,
    /// SIGHUP or a hangup request: clean up and start over.
    Restart,
    /// Anything else: clean up and exit with failure.
    Fail,
}

/// Applies requests, remembering what it installed.
pub struct Privileged<K> {
    kernel: K,
    installed: Option<Ipv4Addr>,
}

impl<K: Kernel> Privileged<K> {
    pub fn new(kernel: K) -> Self {
        Self {
            kernel,
            installed: None,
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn installed(&self) -> Option<Ipv4Addr> {
        self.installed
    }

    /// Carries out one request. Failures are logged; only a hangup or a
    /// terminate request ends the loop.
    pub fn execute(&mut self, request: PrivRequest) -> Option<Shutdown> {
        let result = match &request {
            PrivRequest::DeleteAddress { address } => {
                let result = self.kernel.delete_address(*address);
                if result.is_ok() && self.installed == Some(*address) {
                    self.installed = None;
                }
                result
            }
            PrivRequest::AddAddress { address, mask } => {
                let result = self.kernel.add_address(*address, *mask);
                if result.is_ok() {
                    self.installed = Some(*address);
                }
                result
            }
            PrivRequest::FlushRoutes => self.kernel.flush_routes(),
            PrivRequest::AddRoute(route) => self.kernel.add_route(route),
            PrivRequest::SetMtu { mtu } => self.kernel.set_mtu(*mtu),
            PrivRequest::WriteResolvConf { contents } => self.kernel.write_resolv_conf(contents),
            PrivRequest::Hangup => return Some(Shutdown::Restart),
            PrivRequest::Terminate => return Some(Shutdown::Terminate),
        };
        if let Err(e) = result {
            tracing::warn!("{} failed: {}", request.name(), e);
        }
        None
    }

    /// Removes the address and routes this process installed. Every step
    /// is attempted whatever happens to the others.
    pub fn cleanup(&mut self) {
        if let Some(address) = self.installed.take() {
            if let Err(e) = self.kernel.delete_address(address) {
                tracing::warn!("Failed to delete {}: {}", address, e);
            }
        }
        if let Err(e) = self.kernel.flush_routes() {
            tracing::warn!("Failed to flush routes: {}", e);
        }
    }

    /// Serves requests until a signal, a hangup or the channel closing.
    pub async fn serve(&mut self, mut stream: UnixStream) -> io::Result<Shutdown> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut reader = FrameReader::new();

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                    return Ok(Shutdown::Terminate);
                }
                _ = sighup.recv() => {
                    tracing::info!("Received SIGHUP");
                    return Ok(Shutdown::Restart);
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                    return Ok(Shutdown::Fail);
                }
                read = stream.read_buf(reader.buffer_mut()) => {
                    match read {
                        Ok(0) => {
                            tracing::info!("Unprivileged process went away");
                            return Ok(Shutdown::Fail);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!("Request channel read failed: {}", e);
                            return Ok(Shutdown::Fail);
                        }
                    }
                    loop {
                        let frame = match reader.next_frame() {
                            Ok(Some(frame)) => frame,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!("Request channel: {}", e);
                                return Ok(Shutdown::Fail);
                            }
                        };
                        match PrivRequest::decode(&frame) {
                            Some(request) => {
                                if let Some(shutdown) = self.execute(request) {
                                    return Ok(shutdown);
                                }
                            }
                            None => tracing::warn!(
                                "Discarding request of kind {} with {} byte payload",
                                frame.kind,
                                frame.payload.len()
                            ),
                        }
                    }
                }
            }
        }
    }
}

/// Runs the privileged process to completion. Never returns.
pub fn run<K: Kernel>(kernel: K, stream: std::os::unix::net::UnixStream, argv: Vec<OsString>) -> ! {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let mut privileged = Privileged::new(kernel);
    let shutdown = runtime.block_on(async {
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        privileged.serve(stream).await
    });

    match shutdown {
        Ok(Shutdown::Terminate) => std::process::exit(0),
        Ok(Shutdown::Restart) => {
            privileged.cleanup();
            restart(&argv)
        }
        Ok(Shutdown::Fail) => {
            privileged.cleanup();
            std::process::exit(1)
        }
        Err(e) => {
            tracing::error!("Privileged process failed: {}", e);
            privileged.cleanup();
            std::process::exit(1)
        }
    }
}

/// Replaces this process with a fresh copy of the client.
fn restart(argv: &[OsString]) -> ! {
    let Some((program, args)) = argv.split_first() else {
        tracing::error!("No saved command line to restart with");
        std::process::exit(1);
    };
    tracing::info!("Restarting {}", program.to_string_lossy());
    let err = Command::new(program).args(args).exec();
    tracing::error!("Failed to restart: {}", err);
    std::process::exit(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privsep::message::RouteSpec;
    use bytes::{Bytes, BytesMut};
    use tokio::io::AsyncWriteExt;

    #[derive(Debug, Default)]
    struct RecordingKernel {
        calls: Vec<String>,
        fail_add: bool,
    }

    impl Kernel for RecordingKernel {
        fn delete_address(&mut self, address: Ipv4Addr) -> io::Result<()> {
            self.calls.push(format!("delete {address}"));
            Ok(())
        }

        fn add_address(&mut self, address: Ipv4Addr, mask: Ipv4Addr) -> io::Result<()> {
            self.calls.push(format!("add {address}/{mask}"));
            if self.fail_add {
                return Err(io::Error::from_raw_os_error(libc::EPERM));
            }
            Ok(())
        }

        fn flush_routes(&mut self) -> io::Result<()> {
            self.calls.push("flush".to_string());
            Ok(())
        }

        fn add_route(&mut self, route: &RouteSpec) -> io::Result<()> {
            self.calls.push(format!("route {}/{}", route.destination, route.prefix_len()));
            Ok(())
        }

        fn set_mtu(&mut self, mtu: u16) -> io::Result<()> {
            self.calls.push(format!("mtu {mtu}"));
            Ok(())
        }

        fn write_resolv_conf(&mut self, contents: &[u8]) -> io::Result<()> {
            self.calls.push(format!("resolv {}", contents.len()));
            Ok(())
        }
    }

    fn add(address: [u8; 4]) -> PrivRequest {
        PrivRequest::AddAddress {
            address: Ipv4Addr::from(address),
            mask: Ipv4Addr::new(255, 255, 255, 0),
        }
    }

    #[test]
    fn test_tracks_installed_address() {
        let mut privileged = Privileged::new(RecordingKernel::default());
        assert_eq!(privileged.execute(add([10, 0, 0, 5])), None);
        assert_eq!(privileged.installed(), Some(Ipv4Addr::new(10, 0, 0, 5)));

        privileged.execute(PrivRequest::DeleteAddress {
            address: Ipv4Addr::new(10, 0, 0, 9),
        });
        assert_eq!(privileged.installed(), Some(Ipv4Addr::new(10, 0, 0, 5)));

        privileged.execute(PrivRequest::DeleteAddress {
            address: Ipv4Addr::new(10, 0, 0, 5),
        });
        assert_eq!(privileged.installed(), None);
    }

    #[test]
    fn test_failures_are_tolerated() {
        let mut privileged = Privileged::new(RecordingKernel {
            fail_add: true,
            ..Default::default()
        });
        assert_eq!(privileged.execute(add([10, 0, 0, 5])), None);
        assert_eq!(privileged.installed(), None);
        assert_eq!(privileged.execute(PrivRequest::SetMtu { mtu: 1400 }), None);
        assert_eq!(privileged.kernel().calls.len(), 2);
    }

    #[test]
    fn test_cleanup() {
        let mut privileged = Privileged::new(RecordingKernel::default());
        privileged.execute(add([10, 0, 0, 5]));
        privileged.cleanup();
        assert_eq!(
            privileged.kernel().calls,
            vec!["add 10.0.0.5/255.255.255.0", "delete 10.0.0.5", "flush"]
        );
        assert_eq!(privileged.installed(), None);
    }

    #[tokio::test]
    async fn test_serve_until_hangup() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let mut out = BytesMut::new();
        add([10, 0, 0, 5]).encode(&mut out).unwrap();
        // A SetMtu frame with one byte too many is skipped.
        out.extend_from_slice(&5u32.to_ne_bytes());
        out.extend_from_slice(&3u32.to_ne_bytes());
        out.extend_from_slice(&[0x05, 0xdc, 0x00]);
        PrivRequest::WriteResolvConf {
            contents: Bytes::from_static(b"nameserver 10.0.0.1\n"),
        }
        .encode(&mut out)
        .unwrap();
        PrivRequest::Hangup.encode(&mut out).unwrap();
        PrivRequest::FlushRoutes.encode(&mut out).unwrap();
        theirs.write_all(&out).await.unwrap();

        let mut privileged = Privileged::new(RecordingKernel::default());
        assert_eq!(privileged.serve(ours).await.unwrap(), Shutdown::Restart);
        assert_eq!(
            privileged.kernel().calls,
            vec!["add 10.0.0.5/255.255.255.0", "resolv 20"]
        );
    }

    #[tokio::test]
    async fn test_terminate_leaves_interface_configured() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let mut out = BytesMut::new();
        add([10, 0, 0, 5]).encode(&mut out).unwrap();
        PrivRequest::Terminate.encode(&mut out).unwrap();
        theirs.write_all(&out).await.unwrap();
        drop(theirs);

        let mut privileged = Privileged::new(RecordingKernel::default());
        assert_eq!(privileged.serve(ours).await.unwrap(), Shutdown::Terminate);
        assert_eq!(privileged.kernel().calls, vec!["add 10.0.0.5/255.255.255.0"]);
        assert_eq!(privileged.installed(), Some(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[tokio::test]
    async fn test_serve_ends_when_channel_closes() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);
        let mut privileged = Privileged::new(RecordingKernel::default());
        assert_eq!(privileged.serve(ours).await.unwrap(), Shutdown::Fail);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&6u32.to_ne_bytes());
        out.extend_from_slice(&100_000u32.to_ne_bytes());
        theirs.write_all(&out).await.unwrap();

        let mut privileged = Privileged::new(RecordingKernel::default());
        assert_eq!(privileged.serve(ours).await.unwrap(), Shutdown::Fail);
        assert!(privileged.kernel().calls.is_empty());
    }
}
