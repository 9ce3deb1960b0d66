//! Local network helpers: free-port probing and local IPv4 selection.
//! Grounded on the teacher's `net.rs` (`pick_free_port`) and the interface
//! enumeration in `dioxus_gui.rs`, generalized to the priority order in
//! the spec's §4.4 startup algorithm.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};

/// Pick a random free TCP port by binding to port 0 and returning the
/// assigned port (unchanged from the teacher's helper).
pub fn pick_free_port() -> std::io::Result<u16> {
    let sock = TcpListener::bind(("0.0.0.0", 0))?;
    let port = sock.local_addr()?.port();
    drop(sock);
    Ok(port)
}

fn is_preferred_private(ip: &Ipv4Addr) -> u8 {
    let o = ip.octets();
    if o[0] == 192 && o[1] == 168 {
        0
    } else if o[0] == 10 {
        1
    } else if o[0] == 172 && (16..=31).contains(&o[1]) {
        2
    } else {
        3
    }
}

/// Local IPv4 used to reach a well-known external address, determined
/// purely by the routing decision of a UDP "connect" (no data is sent).
fn route_local_ip() -> Option<Ipv4Addr> {
    let sock = UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect(SocketAddr::from(([8, 8, 8, 8], 80))).ok()?;
    match sock.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// All locally enumerated non-loopback IPv4 addresses.
fn enumerated_non_loopback_ipv4() -> Vec<Ipv4Addr> {
    get_if_addrs::get_if_addrs()
        .map(|ifaces| {
            ifaces
                .into_iter()
                .filter_map(|iface| match iface.ip() {
                    std::net::IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Choose the local IPv4 address per §4.4's priority: (a) routing-table
/// pick, (b) best enumerated non-loopback address (private ranges
/// preferred, most-specific first), (c) loopback.
pub fn select_local_ipv4() -> Ipv4Addr {
    if let Some(ip) = route_local_ip() {
        return ip;
    }
    let mut candidates = enumerated_non_loopback_ipv4();
    candidates.sort_by_key(is_preferred_private);
    candidates
        .into_iter()
        .next()
        .unwrap_or(Ipv4Addr::new(127, 0, 0, 1))
}
