//! SRV resolution.
//!
//! SRV drives server discovery for XMPP (`_xmpp-client._tcp.domain`). The
//! lookup itself rides on hickory's async resolver; the result is re-sorted
//! here so callers always see ascending priority, then ascending weight,
//! stably.

use hickory_resolver::TokioResolver;

use super::{DnsQuery, ResolveError, Result};
use crate::debug;

/// One SRV target, pre-sorted for connection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// Sort order: priority ascending, weight ascending, stable.
pub(crate) fn sort_targets(targets: &mut [SrvTarget]) {
    targets.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.weight.cmp(&b.weight))
    });
}

/// Resolve `_service._proto.domain` and await the sorted targets.
///
/// An NXDOMAIN / no-records answer is a successful empty list: protocols
/// fall back to connecting to the bare domain.
pub async fn resolve_srv_async(service: &str, proto: &str, domain: &str) -> Result<Vec<SrvTarget>> {
    let name = format!("_{service}._{proto}.{domain}.");
    debug::info("dnssrv", &format!("looking up {name}"));

    let resolver = TokioResolver::builder_tokio()
        .map_err(|e| ResolveError::Io(std::io::Error::other(e)))?
        .build();

    let lookup = match resolver.srv_lookup(name.clone()).await {
        Ok(lookup) => lookup,
        Err(e) => {
            if e.is_no_records_found() {
                debug::info("dnssrv", "found 0 SRV entries");
                return Ok(Vec::new());
            }
            return Err(ResolveError::Io(std::io::Error::other(e)));
        }
    };

    let mut targets: Vec<SrvTarget> = lookup
        .iter()
        .map(|srv| SrvTarget {
            host: srv.target().to_utf8().trim_end_matches('.').to_string(),
            port: srv.port(),
            priority: srv.priority(),
            weight: srv.weight(),
        })
        .collect();
    sort_targets(&mut targets);
    debug::info("dnssrv", &format!("found {} SRV entries", targets.len()));
    Ok(targets)
}

pub(super) fn resolve(
    service: &str,
    proto: &str,
    domain: &str,
    query: DnsQuery,
    cb: Box<dyn FnOnce(Result<Vec<SrvTarget>>)>,
) {
    let service = service.to_string();
    let proto = proto.to_string();
    let domain = domain.to_string();
    tokio::task::spawn_local(async move {
        let result = resolve_srv_async(&service, &proto, &domain).await;
        if !query.is_cancelled() {
            cb(result);
        }
    });
}
