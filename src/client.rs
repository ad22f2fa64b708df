//! The event loop of the unprivileged process.
//!
//! One `select!` watches the packet socket, the routing socket, the
//! channel to the privileged process, signals and the handler's single
//! timer. Every handler call is followed by carrying out the actions it
//! queued.

use crate::{
    error::TetherError,
    lease::db::{leases_as_string, DbFile},
    network::{
        kernel::RouteEvent,
        netlink::{NetlinkSocket, RoutingSocket},
        recv_error_is_fatal, PacketSocket, ReceivedFrame,
    },
    privsep::{PrivChannel, PrivRequest},
    process::{self, NullDevice},
    v4::{framing::decode_frame, Action, DhcpV4Handler},
};
use bytes::Bytes;
use chrono::Utc;
use std::{net::SocketAddrV4, time::Duration};
use tokio::{
    net::UdpSocket,
    signal::unix::{signal, SignalKind},
    time::{self, Instant},
};

/// Current wall clock time in unix seconds.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// How the client ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// SIGTERM: the interface stays configured.
    Terminated,
    /// SIGHUP or a changed hardware address; the privileged process
    /// starts a fresh client.
    Restart,
    /// Anything fatal.
    Failed(String),
}

/// The descriptors the client keeps across the chroot.
pub struct Resources {
    pub packets: PacketSocket,
    pub unicast: UdpSocket,
    pub routes: RoutingSocket,
    pub channel: PrivChannel,
    pub lease_db: DbFile,
    pub option_db: Option<DbFile>,
    pub null: NullDevice,
}

pub struct DhcpClient {
    handler: DhcpV4Handler,
    packets: PacketSocket,
    unicast: UdpSocket,
    routes: RoutingSocket,
    channel: PrivChannel,
    lease_db: DbFile,
    option_db: Option<DbFile>,
    null: NullDevice,
    priv_pid: u32,
    foreground: bool,
    /// Last resolv.conf contents handed to the privileged process.
    resolv_conf: Option<String>,
}

impl DhcpClient {
    pub fn new(handler: DhcpV4Handler, resources: Resources, priv_pid: u32, foreground: bool) -> Self {
        let Resources {
            packets,
            unicast,
            routes,
            channel,
            lease_db,
            option_db,
            null,
        } = resources;
        Self {
            handler,
            packets,
            unicast,
            routes,
            channel,
            lease_db,
            option_db,
            null,
            priv_pid,
            foreground,
            resolv_conf: None,
        }
    }

    pub fn handler(&self) -> &DhcpV4Handler {
        &self.handler
    }

    /// Runs until a signal or a fatal condition.
    pub async fn run(mut self) -> Result<Exit, TetherError> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        // The database may hold leases that expired while we were away.
        let leases = leases_as_string(self.handler.leases(), &self.handler.interface().name, now());
        self.write_leases(&leases);

        self.handler.start(now());
        if let Some(exit) = self.dispatch().await? {
            return Ok(exit);
        }

        loop {
            let deadline = self.handler.next_deadline();
            let wake = deadline
                .map(|deadline| {
                    let wait = u64::try_from(deadline - now()).unwrap_or(0);
                    Instant::now() + Duration::from_secs(wait)
                })
                .unwrap_or_else(Instant::now);

            tokio::select! {
                _ = time::sleep_until(wake), if deadline.is_some() => {
                    self.handler.handle_timeout(now());
                }
                frame = self.packets.recv_frame() => {
                    match frame {
                        Ok(frame) => self.frame_received(&frame),
                        Err(e) if recv_error_is_fatal(&e) => return Err(e.into()),
                        Err(e) => {
                            tracing::warn!("Packet socket read failed: {}", e);
                            continue;
                        }
                    }
                }
                events = self.routes.recv_events() => {
                    let mut default_route_changed = false;
                    for event in events? {
                        if event == RouteEvent::DefaultRouteChanged {
                            default_route_changed = true;
                        }
                        self.handler.handle_route_event(now(), event);
                    }
                    if default_route_changed {
                        // Someone else may have rewritten resolv.conf.
                        self.resolv_conf = None;
                    }
                }
                e = self.channel.drive() => {
                    return Err(e.into());
                }
                _ = sighup.recv() => {
                    tracing::info!("Received SIGHUP");
                    self.channel.queue(&PrivRequest::Hangup)?;
                    return self.finish(Exit::Restart).await;
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                    // The privileged side leaves the interface configured.
                    self.channel.queue(&PrivRequest::Terminate)?;
                    return self.finish(Exit::Terminated).await;
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                    return self.finish(Exit::Failed("interrupted".to_string())).await;
                }
            }

            if let Some(exit) = self.dispatch().await? {
                return Ok(exit);
            }
            self.elect_resolv_conf()?;
        }
    }

    fn frame_received(&mut self, frame: &ReceivedFrame) {
        match decode_frame(&frame.data, frame.checksum_ready) {
            Ok(datagram) => {
                tracing::trace!("{} byte datagram from {}", datagram.payload.len(), datagram.from);
                self.handler.handle_packet(now(), datagram.from, datagram.payload);
            }
            // Most traffic on the link is not for us.
            Err(e) => tracing::trace!("Ignoring frame: {}", e),
        }
    }

    /// Carries out what the handler asked for.
    async fn dispatch(&mut self) -> Result<Option<Exit>, TetherError> {
        for action in self.handler.drain_actions() {
            match action {
                Action::Broadcast { frame } => {
                    if let Err(e) = self.packets.send_frame(&frame).await {
                        tracing::warn!("Failed to broadcast: {}", e);
                    }
                }
                Action::Unicast { to, payload } => {
                    let server_port = self.handler.config().server_port;
                    if let Err(e) = self.unicast.send_to(&payload, SocketAddrV4::new(to, server_port)).await {
                        tracing::warn!("Failed to send to {}: {}", to, e);
                    }
                }
                Action::Priv(PrivRequest::Hangup) => {
                    self.channel.queue(&PrivRequest::Hangup)?;
                    return self.finish(Exit::Restart).await.map(Some);
                }
                Action::Priv(request) => self.channel.queue(&request)?,
                Action::WriteLeases(text) => self.write_leases(&text),
                Action::WriteOptionDb(text) => {
                    if let Some(db) = self.option_db.as_mut() {
                        if let Err(e) = db.rewrite(&text) {
                            tracing::warn!("Cannot write {}: {}", db.path().display(), e);
                        }
                    }
                }
                Action::TruncateOptionDb => self.truncate_option_db(),
                Action::Daemonize => {
                    if !self.foreground {
                        process::daemonize(&self.null)?;
                    }
                }
                Action::Fatal(message) => return self.finish(Exit::Failed(message)).await.map(Some),
            }
        }
        Ok(None)
    }

    fn write_leases(&mut self, text: &str) {
        if let Err(e) = self.lease_db.rewrite(text) {
            tracing::warn!("Cannot write {}: {}", self.lease_db.path().display(), e);
        }
    }

    fn truncate_option_db(&mut self) {
        if let Some(db) = self.option_db.as_mut() {
            if let Err(e) = db.truncate() {
                tracing::warn!("Cannot truncate {}: {}", db.path().display(), e);
            }
        }
    }

    /// Writes resolv.conf through the privileged process when the
    /// preferred default route is one we installed.
    fn elect_resolv_conf(&mut self) -> Result<(), TetherError> {
        let Some(contents) = self.handler.resolv_conf() else {
            return Ok(());
        };
        if self.resolv_conf.as_deref() == Some(contents) {
            return Ok(());
        }

        let table = self.handler.interface().table;
        let label = NetlinkSocket::request()
            .map_err(TetherError::from)
            .and_then(|mut socket| socket.default_route_label(table).map_err(TetherError::from));
        let label = match label {
            Ok(label) => label,
            Err(e) => {
                tracing::warn!("Cannot read default route: {}", e);
                return Ok(());
            }
        };
        if label.map(|label| label.pid) != Some(self.priv_pid) {
            tracing::debug!("Default route is not ours; leaving resolv.conf alone");
            return Ok(());
        }

        let contents = contents.to_string();
        self.channel.queue(&PrivRequest::WriteResolvConf {
            contents: Bytes::from(contents.clone()),
        })?;
        self.resolv_conf = Some(contents);
        Ok(())
    }

    /// Flushes outstanding requests and clears the option dump.
    async fn finish(&mut self, exit: Exit) -> Result<Exit, TetherError> {
        self.truncate_option_db();
        if let Err(e) = self.channel.flush().await {
            tracing::warn!("Cannot flush requests: {}", e);
        }
        Ok(exit)
    }
}
