//! The dhclient.conf statements tether understands.
//!
//! A statement that doesn't parse is logged and skipped; only a file that
//! cannot be split into statements at all is an error.

use super::{ClientConfig, OptionAction};
use crate::{
    error::TetherError,
    lease::{db, same_record, Lease, LeaseOrigin},
    lexer::{parse_statements, ParseError, Statement},
    v4::options::OptionCode,
};

pub(super) fn apply(config: &mut ClientConfig, text: &str) -> Result<(), TetherError> {
    let statements = parse_statements(text)?;
    apply_statements(config, &statements);
    Ok(())
}

fn apply_statements(config: &mut ClientConfig, statements: &[Statement]) {
    for statement in statements {
        if let Err(e) = apply_statement(config, statement) {
            tracing::warn!("Configuration {}", e);
        }
    }
}

fn apply_statement(config: &mut ClientConfig, statement: &Statement) -> Result<(), ParseError> {
    match statement.keyword() {
        "send" => {
            let (code, value) = db::option_decl(statement)?;
            config.send_options.insert(code, value);
        }
        "default" => set_action(config, statement, OptionAction::Default)?,
        "supersede" => set_action(config, statement, OptionAction::Supersede)?,
        "prepend" => set_action(config, statement, OptionAction::Prepend)?,
        "append" => set_action(config, statement, OptionAction::Append)?,

        "request" => config.requested_options = option_list(statement)?,
        "require" => config.required_options = option_list(statement)?,
        "ignore" => config.ignored_options = option_list(statement)?,

        "timeout" => config.timeout = statement.seconds()?,
        "retry" => config.retry_interval = statement.seconds()?,
        "select-timeout" => config.select_interval = statement.seconds()?,
        "reboot" => config.reboot_timeout = statement.seconds()?,
        "backoff-cutoff" => config.backoff_cutoff = statement.seconds()?,
        "initial-interval" => config.initial_interval = statement.seconds()?,
        "link-timeout" => config.link_timeout = statement.seconds()?,

        "reject" => {
            for address in statement.rest(1).split(',').map(str::trim) {
                let address = address
                    .parse()
                    .map_err(|_| statement.error(format!("expecting IP address, found '{address}'")))?;
                config.reject_list.push(address);
            }
        }
        "filename" => config.filename = Some(statement.single()?.text()),
        "server-name" => config.server_name = Some(statement.single()?.text()),
        "fixed-address" => config.address = Some(statement.address()?),
        "next-server" => config.next_server = Some(statement.address()?),

        "interface" => {
            let (name, block) = match (statement.tokens.as_slice(), &statement.block) {
                ([_, name], Some(block)) => (name.text(), block),
                _ => return Err(statement.error("expecting interface \"name\" { ... }")),
            };
            if name == config.interface {
                apply_statements(config, block);
            }
        }
        "lease" => {
            let block = statement
                .block
                .as_ref()
                .ok_or_else(|| statement.error("expecting '{'"))?;
            if let Some(lease) = db::parse_lease(block, &config.interface, LeaseOrigin::Static)? {
                add_static_lease(&mut config.static_leases, lease);
            }
        }

        other => return Err(statement.error(format!("expecting statement, found '{other}'"))),
    }
    Ok(())
}

fn set_action(
    config: &mut ClientConfig,
    statement: &Statement,
    action: fn(bytes::Bytes) -> OptionAction,
) -> Result<(), ParseError> {
    let (code, value) = db::option_decl(statement)?;
    config.option_actions.insert(code, action(value));
    Ok(())
}

/// A comma separated list of option names. Duplicates are dropped.
fn option_list(statement: &Statement) -> Result<Vec<OptionCode>, ParseError> {
    let mut codes = Vec::new();
    let text = statement.rest(1);
    for name in text.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let code = OptionCode::from_name(name)
            .ok_or_else(|| statement.error(format!("unknown option name '{name}'")))?;
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    Ok(codes)
}

/// Later declarations replace earlier ones for the same address.
fn add_static_lease(leases: &mut Vec<Lease>, lease: Lease) {
    leases.retain(|old| !same_record(old, &lease));
    leases.push(lease);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::Ipv4Addr, time::Duration};

    fn load(text: &str) -> ClientConfig {
        let mut config = ClientConfig::new("em0".to_string());
        config.apply_file(text).unwrap();
        config
    }

    #[test]
    fn test_timing_and_lists() {
        let config = load(
            "timeout 60;\nretry 5;\nselect-timeout 2;\nbackoff-cutoff 20;\n\
             request subnet-mask, routers;\nrequire routers;\nignore host-name;\n",
        );
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.select_interval, Duration::from_secs(2));
        assert_eq!(config.backoff_cutoff, Duration::from_secs(20));
        assert_eq!(config.requested_options, vec![OptionCode::SUBNET_MASK, OptionCode::ROUTERS]);
        assert_eq!(config.required_options, vec![OptionCode::ROUTERS]);
        assert_eq!(config.ignored_options, vec![OptionCode::HOST_NAME]);
    }

    #[test]
    fn test_option_statements() {
        let config = load(
            "send dhcp-client-identifier \"\";\n\
             supersede domain-name \"example.org\";\n\
             prepend domain-name-servers 127.0.0.1;\n\
             reject 10.0.0.66, 10.0.0.67;\n",
        );
        assert!(config.send_options.get(OptionCode::CLIENT_IDENTIFIER).unwrap().is_empty());
        assert_eq!(
            config.option_actions.get(&OptionCode::DOMAIN_NAME),
            Some(&OptionAction::Supersede(bytes::Bytes::from_static(b"example.org")))
        );
        assert_eq!(
            config.option_actions.get(&OptionCode::DOMAIN_NAME_SERVERS),
            Some(&OptionAction::Prepend(bytes::Bytes::from_static(&[127, 0, 0, 1])))
        );
        assert!(config.is_rejected(Ipv4Addr::new(10, 0, 0, 67)));
    }

    #[test]
    fn test_interface_blocks_and_static_leases() {
        let config = load(
            "interface \"em1\" { timeout 99; }\n\
             interface \"em0\" { timeout 45; }\n\
             lease {\n  interface \"em0\";\n  fixed-address 192.168.1.2;\n  option subnet-mask 255.255.255.0;\n}\n\
             lease {\n  interface \"em1\";\n  fixed-address 192.168.9.9;\n}\n",
        );
        assert_eq!(config.timeout, Duration::from_secs(45));
        assert_eq!(config.static_leases.len(), 1);
        let lease = &config.static_leases[0];
        assert!(lease.is_static());
        assert_eq!(lease.address, Ipv4Addr::new(192, 168, 1, 2));
    }

    #[test]
    fn test_bad_statements_are_skipped() {
        let config = load("timeout soon;\nfrobnicate;\nretry 3;\nsend no-such-option 1;\n");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retry_interval, Duration::from_secs(3));

        let mut config = ClientConfig::new("em0".to_string());
        assert!(config.apply_file("timeout 30").is_err());
    }
}
