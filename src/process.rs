//! Process plumbing: the privsep fork, detaching from the terminal,
//! chroot and the switch to the unprivileged user.
//!
//! Everything here assumes a single-threaded process. `fork` in
//! particular must not run while other threads exist.

use crate::error::TetherError;
use std::{
    ffi::{CStr, CString},
    fs::{File, OpenOptions},
    io,
    os::{fd::AsRawFd, unix::ffi::OsStrExt},
    path::Path,
};

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Which side of a [`fork`] we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent { child: u32 },
    Child,
}

pub fn fork() -> io::Result<Fork> {
    // SAFETY: callers guarantee no other threads are running.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent { child: pid as u32 }),
    }
}

pub fn setsid() -> io::Result<()> {
    // SAFETY: no preconditions.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `/dev/null`, opened before the chroot hides it.
pub struct NullDevice(File);

impl NullDevice {
    pub fn open() -> io::Result<Self> {
        Ok(Self(OpenOptions::new().read(true).write(true).open("/dev/null")?))
    }

    fn redirect_stdio(&self) -> io::Result<()> {
        let fd = self.0.as_raw_fd();
        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            // SAFETY: both descriptors are open.
            check(unsafe { libc::dup2(fd, target) })?;
        }
        Ok(())
    }
}

/// Detaches from the controlling terminal. The parent exits at once; the
/// child continues in a new session with stdio on `/dev/null` and `/` as
/// its working directory.
///
/// Open descriptors, and the locks held through them, carry over to the
/// child.
pub fn daemonize(null: &NullDevice) -> io::Result<()> {
    if let Fork::Parent { .. } = fork()? {
        std::process::exit(0);
    }
    setsid()?;
    null.redirect_stdio()?;
    std::env::set_current_dir("/")
}

/// The account the unprivileged process runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl User {
    /// Looks `name` up in the password database. Must happen before the
    /// chroot.
    pub fn lookup(name: &str) -> Result<Self, TetherError> {
        let unknown = || TetherError::UnknownUser(name.to_string());
        let c_name = CString::new(name).map_err(|_| unknown())?;
        // SAFETY: c_name is NUL-terminated; the returned record is copied
        // out before any other password database call.
        let pw = unsafe { libc::getpwnam(c_name.as_ptr()) };
        if pw.is_null() {
            return Err(unknown());
        }
        // SAFETY: pw is non-null and points at a valid passwd record.
        let (uid, gid, pw_name) = unsafe { ((*pw).pw_uid, (*pw).pw_gid, CStr::from_ptr((*pw).pw_name)) };
        Ok(Self {
            name: pw_name.to_string_lossy().into_owned(),
            uid,
            gid,
        })
    }
}

/// Confines the process to `dir`.
pub fn enter_chroot(dir: &Path) -> io::Result<()> {
    let c_dir = CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chroot path contains NUL"))?;
    // SAFETY: c_dir is NUL-terminated.
    check(unsafe { libc::chroot(c_dir.as_ptr()) })?;
    std::env::set_current_dir("/")
}

/// Gives up root for good: supplementary groups, then group, then user.
pub fn drop_privileges(user: &User) -> io::Result<()> {
    let groups = [user.gid];
    // SAFETY: groups holds exactly one gid.
    check(unsafe { libc::setgroups(1, groups.as_ptr()) })?;
    // SAFETY: no memory is passed.
    check(unsafe { libc::setresgid(user.gid, user.gid, user.gid) })?;
    // SAFETY: no memory is passed.
    check(unsafe { libc::setresuid(user.uid, user.uid, user.uid) })?;
    tracing::debug!("Running as {} ({}:{})", user.name, user.uid, user.gid);
    Ok(())
}

/// Takes an exclusive lock on `file`, waiting for any other holder.
pub fn lock(file: &File) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor is open for the duration of the call.
        match check(unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) }) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_root() {
        let root = User::lookup("root").unwrap();
        assert_eq!(root.uid, 0);
        assert_eq!(root.name, "root");
        assert!(matches!(
            User::lookup("no-such-user-here"),
            Err(TetherError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let file = tempfile::NamedTempFile::new().unwrap();
        lock(file.as_file()).unwrap();

        let other = File::open(file.path()).unwrap();
        // SAFETY: the descriptor is open.
        let ret = unsafe { libc::flock(other.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        assert_eq!(ret, -1);
        assert_eq!(io::Error::last_os_error().raw_os_error(), Some(libc::EWOULDBLOCK));
    }
}
