use thiserror::Error;

/// Reasons a request is refused before any probing happens.
///
/// `Display` is the human-readable message; [`Rejection::tag`] is the stable
/// identifier clients should match on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Could not determine client IP")]
    InvalidIp,
    #[error("Cannot test private/internal IP addresses")]
    PrivateIp,
    #[error("Too many requests. Please try again later.")]
    RateLimited,
    #[error("{0}")]
    InvalidPorts(String),
}

impl Rejection {
    pub fn tag(&self) -> &'static str {
        match self {
            Rejection::InvalidIp => "invalid_ip",
            Rejection::PrivateIp => "private_ip",
            Rejection::RateLimited => "rate_limit_exceeded",
            Rejection::InvalidPorts(_) => "invalid_ports",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Rejection::InvalidIp | Rejection::InvalidPorts(_) => 400,
            Rejection::PrivateIp => 403,
            Rejection::RateLimited => 429,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_and_statuses() {
        assert_eq!(Rejection::PrivateIp.tag(), "private_ip");
        assert_eq!(Rejection::PrivateIp.status(), 403);
        assert_eq!(Rejection::RateLimited.status(), 429);
        let e = Rejection::InvalidPorts("port not allowed: 21".into());
        assert_eq!(e.tag(), "invalid_ports");
        assert_eq!(e.to_string(), "port not allowed: 21");
    }
}
