use std::borrow::Cow;

/// Normalize a bind address.
///
/// Tunnel listeners are created from a bare source port as `":PORT"`, which
/// tokio does not accept; it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Address form used when a listener is created for a tunnel source port.
pub fn any_port(port: u16) -> String {
    format!(":{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_only_binds_all_interfaces() {
        assert_eq!(normalize_bind_addr(":7666").as_ref(), "0.0.0.0:7666");
        assert_eq!(normalize_bind_addr(" :53 ").as_ref(), "0.0.0.0:53");
        assert_eq!(normalize_bind_addr(&any_port(0)).as_ref(), "0.0.0.0:0");
    }

    #[test]
    fn explicit_addresses_pass_through() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:7666").as_ref(),
            "127.0.0.1:7666"
        );
        assert_eq!(normalize_bind_addr("[::]:7666").as_ref(), "[::]:7666");
    }
}
