//! Routes and resolver configuration derived from a bound lease.

use crate::{
    privsep::message::RouteSpec,
    v4::{
        options::{OptionCode, Options},
        pretty::decode_domain_search,
    },
};
use std::{fmt::Write as _, net::Ipv4Addr};

const MAX_NAMESERVERS: usize = 3;

/// One entry of a classless static route option (RFC 3442).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClasslessRoute {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    /// Unspecified for a route directly on the link.
    pub gateway: Ipv4Addr,
}

impl ClasslessRoute {
    pub fn netmask(&self) -> Ipv4Addr {
        prefix_mask(self.prefix_len)
    }
}

pub fn prefix_mask(prefix_len: u8) -> Ipv4Addr {
    match prefix_len {
        0 => Ipv4Addr::UNSPECIFIED,
        n => Ipv4Addr::from(u32::MAX << (32 - u32::from(n.min(32)))),
    }
}

/// Decodes a classless route option. `None` if any entry is malformed.
pub fn decode_classless_routes(mut data: &[u8]) -> Option<Vec<ClasslessRoute>> {
    let mut routes = Vec::new();
    while let Some((&prefix_len, rest)) = data.split_first() {
        if prefix_len > 32 {
            return None;
        }
        let significant = usize::from(prefix_len).div_ceil(8);
        if rest.len() < significant + 4 {
            return None;
        }
        let mut destination = [0u8; 4];
        destination[..significant].copy_from_slice(&rest[..significant]);
        let gateway = <[u8; 4]>::try_from(&rest[significant..significant + 4]).ok()?;
        routes.push(ClasslessRoute {
            destination: Ipv4Addr::from(u32::from(Ipv4Addr::from(destination)) & u32::from(prefix_mask(prefix_len))),
            prefix_len,
            gateway: Ipv4Addr::from(gateway),
        });
        data = &rest[significant + 4..];
    }
    Some(routes)
}

/// Route through `gateway`, sourced from our `address`.
fn gateway_route(destination: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr, address: Ipv4Addr) -> RouteSpec {
    RouteSpec {
        destination,
        netmask,
        gateway,
        source: address,
        addrs: RouteSpec::ADDR_DST | RouteSpec::ADDR_GATEWAY | RouteSpec::ADDR_NETMASK | RouteSpec::ADDR_IFA,
        flags: RouteSpec::FLAG_GATEWAY,
    }
}

/// Route directly on the link.
fn direct_route(destination: Ipv4Addr, netmask: Ipv4Addr, address: Ipv4Addr) -> RouteSpec {
    let flags = if netmask == Ipv4Addr::BROADCAST {
        RouteSpec::FLAG_HOST
    } else {
        0
    };
    RouteSpec {
        destination,
        netmask,
        gateway: Ipv4Addr::UNSPECIFIED,
        source: address,
        addrs: RouteSpec::ADDR_DST | RouteSpec::ADDR_NETMASK | RouteSpec::ADDR_IFA,
        flags,
    }
}

/// The classful mask of a legacy static route destination.
fn classful_mask(destination: Ipv4Addr) -> Option<Ipv4Addr> {
    match destination.octets()[0] {
        0..=127 => Some(Ipv4Addr::new(255, 0, 0, 0)),
        128..=191 => Some(Ipv4Addr::new(255, 255, 0, 0)),
        192..=223 => Some(Ipv4Addr::new(255, 255, 255, 0)),
        _ => None,
    }
}

/// The routes to install for a lease on `address`, in order.
///
/// Classless routes (121, else 249) win outright. Otherwise the first
/// router becomes the default route, preceded by a host route to it when
/// it is not reachable through the subnet, and legacy static routes (33)
/// follow.
pub fn lease_routes(address: Ipv4Addr, mask: Ipv4Addr, options: &Options) -> Vec<RouteSpec> {
    for code in [OptionCode::CLASSLESS_STATIC_ROUTES, OptionCode::CLASSLESS_MS_STATIC_ROUTES] {
        let Some(value) = options.get(code).filter(|v| !v.is_empty()) else {
            continue;
        };
        let Some(routes) = decode_classless_routes(value) else {
            tracing::warn!("Ignoring malformed {}", code.name());
            return Vec::new();
        };
        return routes
            .into_iter()
            .map(|route| {
                if route.gateway.is_unspecified() {
                    direct_route(route.destination, route.netmask(), address)
                } else {
                    gateway_route(route.destination, route.netmask(), route.gateway, address)
                }
            })
            .collect();
    }

    let mut specs = Vec::new();
    // Only the first router is used.
    let router = options
        .get(OptionCode::ROUTERS)
        .filter(|v| v.len() >= 4)
        .map(|v| Ipv4Addr::new(v[0], v[1], v[2], v[3]));
    if let Some(router) = router {
        if router == address {
            specs.push(direct_route(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, address));
        } else {
            let on_link = u32::from(router) & u32::from(mask) == u32::from(address) & u32::from(mask);
            if mask == Ipv4Addr::BROADCAST || !on_link {
                specs.push(direct_route(router, Ipv4Addr::BROADCAST, address));
            }
            specs.push(gateway_route(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, router, address));
        }
    }

    if let Some(value) = options.get(OptionCode::STATIC_ROUTES) {
        for pair in value.chunks_exact(8) {
            let destination = Ipv4Addr::new(pair[0], pair[1], pair[2], pair[3]);
            let gateway = Ipv4Addr::new(pair[4], pair[5], pair[6], pair[7]);
            // A default route here would fight the router option.
            if destination.is_unspecified() {
                continue;
            }
            if let Some(netmask) = classful_mask(destination) {
                specs.push(gateway_route(destination, netmask, gateway, address));
            }
        }
    }
    specs
}

/// The resolv.conf the lease calls for, or `None` when it names neither
/// a search domain nor a nameserver.
pub fn resolv_conf_contents(ifname: &str, options: &Options, tail: Option<&str>) -> Option<String> {
    let search = options
        .get(OptionCode::DOMAIN_SEARCH)
        .and_then(|v| decode_domain_search(v))
        .or_else(|| {
            options
                .get(OptionCode::DOMAIN_NAME)
                .map(|v| String::from_utf8_lossy(v).trim_end_matches('\0').to_string())
                .filter(|name| !name.is_empty())
        });

    let nameservers: Vec<Ipv4Addr> = options
        .get(OptionCode::DOMAIN_NAME_SERVERS)
        .map(|v| {
            v.chunks_exact(4)
                .map(|a| Ipv4Addr::new(a[0], a[1], a[2], a[3]))
                .take(MAX_NAMESERVERS)
                .collect()
        })
        .unwrap_or_default();

    if search.is_none() && nameservers.is_empty() {
        return None;
    }

    let mut contents = format!("# Generated by {ifname} dhclient\n");
    if let Some(search) = search {
        let _ = writeln!(contents, "search {search}");
    }
    for nameserver in nameservers {
        let _ = writeln!(contents, "nameserver {nameserver}");
    }
    if let Some(tail) = tail {
        contents.push_str(tail);
    }
    Some(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    #[test]
    fn test_decode_classless() {
        // 10.0.0.0/8 via 10.0.0.1, 0.0.0.0/0 via 10.0.0.254, 192.168.1.0/24 on link.
        let data = [
            8, 10, 10, 0, 0, 1, 0, 10, 0, 0, 254, 24, 192, 168, 1, 0, 0, 0, 0,
        ];
        let routes = decode_classless_routes(&data).unwrap();
        assert_eq!(
            routes,
            vec![
                ClasslessRoute {
                    destination: Ipv4Addr::new(10, 0, 0, 0),
                    prefix_len: 8,
                    gateway: Ipv4Addr::new(10, 0, 0, 1),
                },
                ClasslessRoute {
                    destination: Ipv4Addr::UNSPECIFIED,
                    prefix_len: 0,
                    gateway: Ipv4Addr::new(10, 0, 0, 254),
                },
                ClasslessRoute {
                    destination: Ipv4Addr::new(192, 168, 1, 0),
                    prefix_len: 24,
                    gateway: Ipv4Addr::UNSPECIFIED,
                },
            ]
        );
        assert_eq!(routes[2].netmask(), MASK);

        assert!(decode_classless_routes(&[33, 0, 0, 0, 0]).is_none());
        assert!(decode_classless_routes(&[24, 192, 168, 1, 10, 0]).is_none());
    }

    #[test]
    fn test_router_routes() {
        let mut options = Options::new();
        options.insert(OptionCode::ROUTERS, vec![10, 0, 0, 1, 10, 0, 0, 2]);
        options.insert(OptionCode::STATIC_ROUTES, vec![0, 0, 0, 0, 10, 0, 0, 9, 172, 16, 0, 0, 10, 0, 0, 3]);

        let specs = lease_routes(ADDRESS, MASK, &options);
        assert_eq!(specs.len(), 2);
        assert!(specs[0].has_gateway());
        assert_eq!(specs[0].prefix_len(), 0);
        assert_eq!(specs[0].gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(specs[1].destination, Ipv4Addr::new(172, 16, 0, 0));
        assert_eq!(specs[1].prefix_len(), 16);
        assert_eq!(specs[1].gateway, Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_host_route_to_unreachable_router() {
        let mut options = Options::new();
        options.insert(OptionCode::ROUTERS, vec![10, 0, 0, 1]);

        let specs = lease_routes(ADDRESS, Ipv4Addr::BROADCAST, &options);
        assert_eq!(specs.len(), 2);
        assert!(!specs[0].has_gateway());
        assert_eq!(specs[0].destination, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(specs[0].prefix_len(), 32);
        assert!(specs[1].has_gateway());

        let mut options = Options::new();
        options.insert(OptionCode::ROUTERS, vec![192, 168, 0, 1]);
        let specs = lease_routes(ADDRESS, MASK, &options);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].destination, Ipv4Addr::new(192, 168, 0, 1));
    }

    #[test]
    fn test_classless_wins() {
        let mut options = Options::new();
        options.insert(OptionCode::ROUTERS, vec![10, 0, 0, 1]);
        options.insert(OptionCode::CLASSLESS_MS_STATIC_ROUTES, vec![0, 10, 0, 0, 99]);
        options.insert(OptionCode::CLASSLESS_STATIC_ROUTES, vec![0, 10, 0, 0, 254]);

        let specs = lease_routes(ADDRESS, MASK, &options);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].gateway, Ipv4Addr::new(10, 0, 0, 254));

        options.insert(OptionCode::CLASSLESS_STATIC_ROUTES, vec![40]);
        assert!(lease_routes(ADDRESS, MASK, &options).is_empty());
    }

    #[test]
    fn test_resolv_conf() {
        let mut options = Options::new();
        assert_eq!(resolv_conf_contents("em0", &options, None), None);

        options.insert(OptionCode::DOMAIN_NAME, bytes::Bytes::from_static(b"example.org"));
        options.insert(
            OptionCode::DOMAIN_NAME_SERVERS,
            vec![10, 0, 0, 1, 10, 0, 0, 2, 10, 0, 0, 3, 10, 0, 0, 4],
        );
        let contents = resolv_conf_contents("em0", &options, Some("options edns0\n")).unwrap();
        assert_eq!(
            contents,
            "# Generated by em0 dhclient\n\
             search example.org\n\
             nameserver 10.0.0.1\n\
             nameserver 10.0.0.2\n\
             nameserver 10.0.0.3\n\
             options edns0\n"
        );

        // Domain search takes precedence over the domain name.
        options.insert(
            OptionCode::DOMAIN_SEARCH,
            vec![3, b'e', b'n', b'g', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'o', b'r', b'g', 0],
        );
        let contents = resolv_conf_contents("em0", &options, None).unwrap();
        assert!(contents.contains("search eng.example.org\n"));
    }
}
