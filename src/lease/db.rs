//! The text form of leases kept in the lease database and the option
//! dump file.
//!
//! ```text
//! lease {
//!   interface "em0";
//!   fixed-address 10.0.0.5;
//!   next-server 0.0.0.0;
//!   option subnet-mask 255.255.255.0;
//!   option domain-name-servers 10.0.0.1,10.0.0.2;
//!   renew 6 2017/04/08 05:47:50 UTC;
//!   rebind 6 2017/04/08 10:02:50 UTC;
//!   expire 6 2017/04/08 11:32:50 UTC;
//! }
//! ```

use super::{Lease, LeaseOrigin, LeaseStore};
use crate::{
    lexer::{parse_statements, ParseError, Statement},
    v4::{
        options::OptionCode,
        pretty::{parse_option_value, pretty_print, print_text, unquote, FormatError},
    },
};
use crate::process;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    net::Ipv4Addr,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

const TIME_FORMAT: &str = "%w %Y/%m/%d %H:%M:%S UTC";
const MAX_SSID_LEN: usize = 32;

pub fn format_time(t: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(t, 0).map(|dt| dt.format(TIME_FORMAT).to_string())
}

/// Parses `<weekday> <yyyy>/<mm>/<dd> <HH>:<MM>:<SS> UTC`. The weekday is
/// not checked.
pub fn parse_time(text: &str) -> Option<i64> {
    let (_, rest) = text.trim().split_once(' ')?;
    let rest = rest.trim().strip_suffix("UTC")?.trim();
    NaiveDateTime::parse_from_str(rest, "%Y/%m/%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Renders `lease` as a `kind { ... }` stanza.
pub fn lease_as_string(kind: &str, ifname: &str, lease: &Lease) -> Result<String, FormatError> {
    let mut out = format!("{kind} {{\n");
    if lease.is_bootp() {
        out.push_str("  bootp;\n");
    }
    out.push_str(&format!("  interface {};\n", print_text(ifname.as_bytes(), true)));
    out.push_str(&format!("  fixed-address {};\n", lease.address));
    out.push_str(&format!("  next-server {};\n", lease.next_server));
    if let Some(filename) = &lease.filename {
        out.push_str(&format!("  filename {};\n", print_text(filename.as_bytes(), true)));
    }
    if let Some(server_name) = &lease.server_name {
        out.push_str(&format!("  server-name {};\n", print_text(server_name.as_bytes(), true)));
    }
    if !lease.ssid.is_empty() {
        out.push_str(&format!("  ssid {};\n", print_text(&lease.ssid, true)));
    }

    for (code, value) in lease.options.iter() {
        if value.is_empty() {
            continue;
        }
        let text = pretty_print(code, value, true)?;
        out.push_str(&format!("  option {} {};\n", code.name(), text));
    }

    for (keyword, t) in [
        ("renew", lease.renewal),
        ("rebind", lease.rebind),
        ("expire", lease.expiry),
    ] {
        let time = format_time(t).ok_or_else(|| FormatError::Value {
            name: keyword.to_string(),
            text: t.to_string(),
        })?;
        out.push_str(&format!("  {keyword} {time};\n"));
    }
    out.push_str("}\n");
    Ok(out)
}

/// The lease database contents: unexpired dynamic leases, oldest first.
pub fn leases_as_string(store: &LeaseStore, ifname: &str, now: i64) -> String {
    let mut out = String::new();
    for lease in store.dynamic().iter().rev() {
        if lease.is_expired(now) {
            continue;
        }
        match lease_as_string("lease", ifname, lease) {
            Ok(text) => out.push_str(&text),
            Err(e) => tracing::warn!("Cannot make lease into string: {}", e),
        }
    }
    out
}

/// The option dump: the lease as offered, then as applied.
pub fn option_db_string(ifname: &str, offered: &Lease, effective: &Lease) -> String {
    let mut out = String::new();
    for (kind, lease) in [("offered", offered), ("effective", effective)] {
        match lease_as_string(kind, ifname, lease) {
            Ok(text) => out.push_str(&text),
            Err(e) => tracing::warn!("Cannot make {} lease into string: {}", kind, e),
        }
    }
    out
}

/// A database file held open and locked for the life of the client, so
/// it stays writable after the chroot.
#[derive(Debug)]
pub struct DbFile {
    file: File,
    path: PathBuf,
}

impl DbFile {
    /// Opens or creates `path` and waits for its lock.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o640)
            .custom_flags(libc::O_NOFOLLOW)
            .open(path)?;
        process::lock(&file)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contents(&mut self) -> io::Result<String> {
        let mut text = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut text)?;
        Ok(text)
    }

    /// Replaces the contents with `text` and syncs.
    pub fn rewrite(&mut self, text: &str) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(text.as_bytes())?;
        self.file.set_len(text.len() as u64)?;
        self.file.sync_all()
    }

    pub fn truncate(&mut self) -> io::Result<()> {
        self.rewrite("")
    }
}

/// Loads the lease database into `store`. Stanzas that don't parse, belong
/// to another interface or have expired are skipped.
pub fn read_leases(store: &mut LeaseStore, text: &str, ifname: &str, now: i64) -> Result<(), ParseError> {
    for statement in parse_statements(text)? {
        let block = match (statement.keyword(), &statement.block) {
            ("lease", Some(block)) => block,
            _ => {
                tracing::warn!("Lease database line {}: expecting lease", statement.line);
                continue;
            }
        };
        match parse_lease(block, ifname, LeaseOrigin::Dynamic) {
            Ok(Some(lease)) if lease.is_expired(now) => {
                tracing::debug!("Skipping expired lease for {}", lease.address);
            }
            Ok(Some(lease)) => store.push_recorded(lease),
            Ok(None) => {}
            Err(e) => tracing::warn!("Lease database {}", e),
        }
    }
    Ok(())
}

/// Builds a lease from the statements of a `lease { ... }` block. `None`
/// if the block names a different interface.
pub fn parse_lease(
    block: &[Statement],
    ifname: &str,
    origin: LeaseOrigin,
) -> Result<Option<Lease>, ParseError> {
    let mut lease = Lease::new(Ipv4Addr::UNSPECIFIED, origin);
    let mut ours = true;

    for statement in block {
        match statement.keyword() {
            // Informational only; BOOTP leases are those without a type.
            "bootp" => {}
            "interface" => {
                let name = statement.single()?.text();
                if name != ifname {
                    if origin == LeaseOrigin::Dynamic {
                        tracing::warn!("Lease for wrong interface name '{}'", name);
                    }
                    ours = false;
                }
            }
            "fixed-address" => lease.address = statement.address()?,
            "next-server" => lease.next_server = statement.address()?,
            "filename" => lease.filename = Some(statement.single()?.text()),
            "server-name" => lease.server_name = Some(statement.single()?.text()),
            "ssid" => {
                let ssid = unquote(&statement.single()?.raw)
                    .filter(|ssid| ssid.len() <= MAX_SSID_LEN)
                    .ok_or_else(|| statement.error("invalid ssid"))?;
                lease.ssid = ssid;
            }
            "option" => {
                let (code, value) = option_decl(statement)?;
                lease.options.insert(code, value);
            }
            keyword @ ("renew" | "rebind" | "expire") => {
                let t = parse_time(&statement.rest(1))
                    .ok_or_else(|| statement.error(format!("{keyword}: invalid date")))?;
                match keyword {
                    "renew" => lease.renewal = t,
                    "rebind" => lease.rebind = t,
                    _ => lease.expiry = t,
                }
            }
            other => {
                return Err(statement.error(format!("expecting lease declaration, found '{other}'")));
            }
        }
    }

    Ok(ours.then_some(lease))
}

/// Parses `<keyword> <option-name> <value...>`, as used by `option`,
/// `send`, `default` and friends.
pub(crate) fn option_decl(statement: &Statement) -> Result<(OptionCode, Bytes), ParseError> {
    let name = statement
        .tokens
        .get(1)
        .ok_or_else(|| statement.error("expecting option name"))?;
    let code = OptionCode::from_name(&name.raw)
        .ok_or_else(|| statement.error(format!("unknown option name '{}'", name.raw)))?;
    let value = parse_option_value(code, &statement.rest(2)).map_err(|e| statement.error(e.to_string()))?;
    Ok((code, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lease() -> Lease {
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 0, 5), LeaseOrigin::Dynamic);
        lease.next_server = Ipv4Addr::new(10, 0, 0, 1);
        lease.server_name = Some("boot.example.org".to_string());
        lease.filename = Some("pxe \"linux\"".to_string());
        lease.options.insert(OptionCode::MESSAGE_TYPE, vec![5]);
        lease.options.insert(OptionCode::SUBNET_MASK, vec![255, 255, 255, 0]);
        lease.options.insert(OptionCode::DOMAIN_NAME_SERVERS, vec![10, 0, 0, 1, 10, 0, 0, 2]);
        lease.options.insert(OptionCode::DOMAIN_NAME, Bytes::from_static(b"example.org"));
        lease.options.insert(OptionCode::CLIENT_IDENTIFIER, vec![1, 0, 0x0c, 0x29, 0xa8, 0x92, 0xf4]);
        lease.renewal = 1_491_630_470;
        lease.rebind = 1_491_645_770;
        lease.expiry = 1_491_651_170;
        lease
    }

    #[test]
    fn test_time_format() {
        assert_eq!(format_time(1_491_630_470).unwrap(), "6 2017/04/08 05:47:50 UTC");
        assert_eq!(parse_time("6 2017/04/08 05:47:50 UTC"), Some(1_491_630_470));
        assert_eq!(parse_time("2017/04/08 05:47:50"), None);
    }

    #[test]
    fn test_lease_text() {
        let text = lease_as_string("lease", "em0", &sample_lease()).unwrap();
        assert!(text.starts_with("lease {\n  interface \"em0\";\n  fixed-address 10.0.0.5;\n"));
        assert!(text.contains("  option domain-name-servers 10.0.0.1,10.0.0.2;\n"));
        assert!(text.contains("  option domain-name \"example.org\";\n"));
        assert!(text.contains("  filename \"pxe \\\"linux\\\"\";\n"));
        assert!(text.contains("  expire 6 2017/04/08 11:32:50 UTC;\n"));
        assert!(!text.contains("bootp"));
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn test_lease_text_reads_back() {
        let lease = sample_lease();
        let text = lease_as_string("lease", "em0", &lease).unwrap();
        let mut store = LeaseStore::default();
        read_leases(&mut store, &text, "em0", 0).unwrap();
        assert_eq!(store.dynamic(), &[lease]);
    }

    #[test]
    fn test_read_skips_foreign_expired_and_broken() {
        let mut lease = sample_lease();
        let ours = lease_as_string("lease", "em0", &lease).unwrap();
        let theirs = lease_as_string("lease", "em1", &lease).unwrap();
        lease.address = Ipv4Addr::new(10, 0, 0, 6);
        lease.expiry = 100;
        let expired = lease_as_string("lease", "em0", &lease).unwrap();
        let broken = "lease {\n  fixed-address 10.0.0.300;\n}\n";

        let text = format!("{theirs}{expired}{broken}{ours}");
        let mut store = LeaseStore::default();
        read_leases(&mut store, &text, "em0", 1_000_000).unwrap();
        assert_eq!(store.dynamic().len(), 1);
        assert_eq!(store.dynamic()[0].address, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn test_database_is_oldest_first() {
        let mut older = sample_lease();
        older.address = Ipv4Addr::new(10, 0, 0, 4);
        let newer = sample_lease();

        let mut store = LeaseStore::default();
        store.record_bound(&older, 0);
        store.record_bound(&newer, 0);
        let text = leases_as_string(&store, "em0", 0);
        let first = text.find("10.0.0.4").unwrap();
        let second = text.find("10.0.0.5").unwrap();
        assert!(first < second);

        // Reading it back restores newest first.
        let mut reread = LeaseStore::default();
        read_leases(&mut reread, &text, "em0", 0).unwrap();
        assert_eq!(reread.dynamic()[0].address, newer.address);
    }

    #[test]
    fn test_db_file_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhclient.leases.em0");
        let mut db = DbFile::open(&path).unwrap();
        assert_eq!(db.contents().unwrap(), "");

        let text = lease_as_string("lease", "em0", &sample_lease()).unwrap();
        db.rewrite(&text).unwrap();
        db.rewrite("lease {\n}\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "lease {\n}\n");
        assert_eq!(db.contents().unwrap(), "lease {\n}\n");

        db.truncate().unwrap();
        assert_eq!(std::fs::metadata(db.path()).unwrap().len(), 0);
    }

    #[test]
    fn test_option_db() {
        let offered = sample_lease();
        let mut effective = offered.clone();
        effective.options.remove(OptionCode::DOMAIN_NAME);
        let text = option_db_string("em0", &offered, &effective);
        assert!(text.starts_with("offered {\n"));
        assert!(text.contains("}\neffective {\n"));
        assert_eq!(text.matches("domain-name \"example.org\"").count(), 1);
    }
}
