use clap::Parser;
use rand::{rngs::StdRng, SeedableRng};
use std::{
    ffi::OsString,
    os::unix::net::UnixStream,
    process::ExitCode,
};
use tether::{
    client::{self, DhcpClient, Exit, Resources},
    lease::{db, db::DbFile, LeaseStore},
    network::{
        host::SystemHost,
        kernel::{Arbiter, RouteLabel},
        netlink::{self, NetlinkKernel, NetlinkSocket, RTMGRP_IPV4_IFADDR, RTMGRP_IPV4_ROUTE, RTMGRP_LINK},
        new_tokio_socket_bound_to_device, Interface, PacketSocket,
    },
    privsep::{privileged, PrivChannel},
    process::{self, Fork, NullDevice, User},
    Args, ClientConfig, DhcpV4Handler, TetherError,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    let args = Args::parse();

    let fallback = if args.quiet { "warn" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .ok();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Sets up both processes. Only the unprivileged one returns.
fn run(args: Args) -> Result<ExitCode, TetherError> {
    // SAFETY: no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        return Err(TetherError::Critical("must be run as root".to_string()));
    }
    let argv: Vec<OsString> = std::env::args_os().collect();

    let interface = Interface::lookup(&args.interface)?;
    let mut config = ClientConfig::load(&args)?;
    config.set_default_client_identifier(interface.hw);
    let user = User::lookup(&args.user)?;
    let null = NullDevice::open()?;

    let (ours, theirs) = UnixStream::pair()?;
    let priv_pid = match process::fork()? {
        Fork::Child => {
            drop(ours);
            run_privileged(interface.index, theirs, argv)
        }
        Fork::Parent { child } => child,
    };
    drop(theirs);

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(unprivileged(args, interface, config, user, null, ours, priv_pid))
}

fn run_privileged(ifindex: u32, stream: UnixStream, argv: Vec<OsString>) -> ! {
    if let Err(e) = process::setsid().and_then(|()| std::env::set_current_dir("/")) {
        tracing::warn!("Cannot detach privileged process: {}", e);
    }
    let label = RouteLabel::new(std::process::id());
    match NetlinkKernel::new(ifindex, label) {
        Ok(kernel) => privileged::run(kernel, stream, argv),
        Err(e) => {
            tracing::error!("Cannot open routing socket: {}", e);
            std::process::exit(1)
        }
    }
}

async fn unprivileged(
    args: Args,
    interface: Interface,
    config: ClientConfig,
    user: User,
    null: NullDevice,
    stream: UnixStream,
    priv_pid: u32,
) -> Result<ExitCode, TetherError> {
    let channel = PrivChannel::from_std(stream)?;
    let packets = PacketSocket::open(&interface)?;
    let unicast = new_tokio_socket_bound_to_device(&interface.name, config.client_port)?;

    let mut listener = NetlinkSocket::open(RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV4_ROUTE)?;
    let mut arbiter = Arbiter::new(interface.index, rand::random());
    netlink::take_charge(&mut listener, &mut arbiter, interface.index)?;
    let routes = listener.into_async()?;

    let mut lease_db = DbFile::open(&args.lease_db_path())?;
    let mut leases = LeaseStore::new(Vec::new(), config.static_leases.clone());
    match lease_db.contents() {
        Ok(text) => {
            if let Err(e) = db::read_leases(&mut leases, &text, &interface.name, client::now()) {
                tracing::warn!("{}: {}", lease_db.path().display(), e);
            }
        }
        Err(e) => tracing::warn!("Cannot read {}: {}", lease_db.path().display(), e),
    }
    let mut option_db = args.option_db.as_deref().map(DbFile::open).transpose()?;
    if let Some(db) = option_db.as_mut() {
        db.truncate()?;
    }

    process::enter_chroot(&args.chroot)?;
    process::drop_privileges(&user)?;

    let handler = DhcpV4Handler::new(interface, config, leases, Box::new(SystemHost), StdRng::from_os_rng())
        .with_arbiter(arbiter);
    let resources = Resources {
        packets,
        unicast,
        routes,
        channel,
        lease_db,
        option_db,
        null,
    };
    match DhcpClient::new(handler, resources, priv_pid, args.foreground).run().await? {
        Exit::Terminated | Exit::Restart => Ok(ExitCode::SUCCESS),
        Exit::Failed(_) => Ok(ExitCode::FAILURE),
    }
}
