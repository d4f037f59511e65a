use actix_web::dev::ServiceRequest;
use actix_web::ResponseError;
use std::net::{AddrParseError, IpAddr, Ipv6Addr};
use thiserror::Error;

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>;

/// Utility to create a function that derives the identifier of a request.
///
/// Components are joined with `-` in the order: custom key, real IP, peer IP, path, custom
/// function.
pub struct KeyFunctionBuilder {
    real_ip_key: bool,
    peer_ip_key: bool,
    path_key: bool,
    custom_key: Option<String>,
    custom_fn: Option<CustomFn>,
}

impl Default for KeyFunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyFunctionBuilder {
    pub fn new() -> Self {
        Self {
            real_ip_key: false,
            peer_ip_key: false,
            path_key: false,
            custom_key: None,
            custom_fn: None,
        }
    }

    /// Adds the client's real IP to the identifier.
    ///
    /// # Security
    ///
    /// This calls
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
    /// internally which is only suitable for Actix applications deployed behind a proxy that you
    /// control.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn real_ip_key(mut self) -> Self {
        self.real_ip_key = true;
        self
    }

    /// Adds the connection peer IP to the identifier.
    ///
    /// This is suitable when clients connect directly to the Actix application.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn peer_ip_key(mut self) -> Self {
        self.peer_ip_key = true;
        self
    }

    /// Add the request path to the identifier
    pub fn path_key(mut self) -> Self {
        self.path_key = true;
        self
    }

    /// Add a custom component to the identifier
    pub fn custom_key(mut self, key: &str) -> Self {
        self.custom_key = Some(key.to_owned());
        self
    }

    /// Dynamically add a custom component to the identifier
    pub fn custom_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static,
    {
        self.custom_fn = Some(Box::new(f));
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static {
        move |req| {
            let mut components = Vec::new();
            let info = req.connection_info();
            if let Some(custom) = &self.custom_key {
                components.push(custom.clone());
            }
            if self.real_ip_key {
                let addr = info.realip_remote_addr().ok_or(Error::MissingAddress)?;
                components.push(ip_key(addr)?)
            }
            if self.peer_ip_key {
                let addr = info.peer_addr().ok_or(Error::MissingAddress)?;
                components.push(ip_key(addr)?)
            }
            if self.path_key {
                components.push(req.path().to_owned());
            }
            if let Some(f) = &self.custom_fn {
                components.push(f(req)?)
            }
            Ok(components.join("-"))
        }
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error("Unable to parse remote IP address: {0}")]
    InvalidIpError(
        #[source]
        #[from]
        AddrParseError,
    ),
    #[error("The request has no remote address")]
    MissingAddress,
}

impl ResponseError for Error {}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(addr: &str) -> Result<String, Error> {
    // realip_remote_addr() may still include the port
    let ip = match addr.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(e) => match addr.parse::<std::net::SocketAddr>() {
            Ok(socket) => socket.ip(),
            Err(_) => return Err(e.into()),
        },
    };
    Ok(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Ok(v4.to_string());
            }
            let [a, b, c, d, ..] = v6.segments();
            let subnet = Ipv6Addr::new(a, b, c, d, 0, 0, 0, 0);
            format!("{}/64", subnet)
        }
    })
}
