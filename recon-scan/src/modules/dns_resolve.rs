/*!
Forward DNS resolution of discovered hostnames
*/

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tracing::debug;

use recon_engine::{EngineResult, Event, ModuleContext, ModuleDescriptor, ScanModule};

/// Resolves names to addresses, feeding the scan's shared resolution cache
/// so the scope predicate can tie addresses back to in-scope names.
#[derive(Default)]
pub struct DnsResolve {
    resolver: Option<TokioAsyncResolver>,
}

#[async_trait]
impl ScanModule for DnsResolve {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("dns_resolve", "1.0")
            .consumes(&["DOMAIN_NAME_TARGET", "DOMAIN_NAME", "INTERNET_NAME"])
            .produces(&["IP_ADDRESS", "IPV6_ADDRESS"])
            .use_cases(&["FOOTPRINT", "INVESTIGATE", "PASSIVE"])
    }

    async fn setup(&mut self, _ctx: &ModuleContext) -> EngineResult<()> {
        self.resolver = Some(TokioAsyncResolver::tokio(
            ResolverConfig::default(),
            ResolverOpts::default(),
        ));
        Ok(())
    }

    async fn handle(&mut self, event: &Event, ctx: &ModuleContext) -> EngineResult<()> {
        let name = event.data.trim().to_ascii_lowercase();

        let addresses = match ctx.cached_resolution(&name)? {
            Some(cached) => cached,
            None => {
                let Some(resolver) = &self.resolver else {
                    return Ok(());
                };
                match resolver.lookup_ip(name.as_str()).await {
                    Ok(lookup) => {
                        let addresses: Vec<String> =
                            lookup.iter().map(|a| a.to_string()).collect();
                        ctx.cache_resolution(&name, &addresses)?;
                        addresses
                    }
                    Err(e) => {
                        debug!(name = %name, "lookup failed: {e}");
                        return Ok(());
                    }
                }
            }
        };

        for address in addresses {
            let event_type = if address.contains(':') {
                "IPV6_ADDRESS"
            } else {
                "IP_ADDRESS"
            };
            ctx.emit(event_type, &address, event).await?;
        }
        Ok(())
    }
}
