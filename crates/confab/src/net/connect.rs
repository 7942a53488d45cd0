//! TCP connect helper: resolve, then try each address in order.

use std::rc::Rc;

use tokio::net::TcpStream;

use super::{Error, Result};
use crate::debug;
use crate::resolver::Resolver;

/// Connect helper bound to a resolver. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    resolver: Rc<Resolver>,
}

impl Connector {
    pub fn new(resolver: Rc<Resolver>) -> Connector {
        Connector { resolver }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Resolve `host` and connect to the first reachable address.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addrs = self.resolver.resolve_async(host, port).await?;
        let mut last = None;
        for addr in addrs {
            debug::misc("connect", &format!("trying {addr}"));
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    debug::info("connect", &format!("connected to {addr}"));
                    return Ok(stream);
                }
                Err(e) => {
                    debug::info("connect", &format!("{addr} failed: {e}"));
                    last = Some(e);
                }
            }
        }
        Err(Error::Connect {
            host: host.to_string(),
            port,
            source: last
                .unwrap_or_else(|| std::io::Error::other("no addresses to try")),
        })
    }
}
