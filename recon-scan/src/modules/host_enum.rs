/*!
Hostname enumeration over a list of common subdomain prefixes
*/

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tracing::debug;

use recon_engine::{EngineResult, Event, ModuleContext, ModuleDescriptor, OptionSpec, ScanModule};

const DEFAULT_PREFIXES: &str = "www,mail,ns1,ns2,ftp,vpn,dev,staging,api,webmail";

/// Guesses hostnames under a domain and keeps the ones that resolve.
#[derive(Default)]
pub struct HostEnum {
    resolver: Option<TokioAsyncResolver>,
}

pub fn split_prefixes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

#[async_trait]
impl ScanModule for HostEnum {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("host_enum", "1.0")
            .consumes(&["DOMAIN_NAME_TARGET", "DOMAIN_NAME"])
            .produces(&["INTERNET_NAME"])
            .use_cases(&["FOOTPRINT", "INVESTIGATE"])
            .option(
                "prefixes",
                OptionSpec::new(DEFAULT_PREFIXES, "Comma-separated subdomain prefixes to try"),
            )
            .option(
                "verify",
                OptionSpec::new("true", "Only report hostnames that resolve in DNS"),
            )
    }

    async fn setup(&mut self, _ctx: &ModuleContext) -> EngineResult<()> {
        self.resolver = Some(TokioAsyncResolver::tokio(
            ResolverConfig::default(),
            ResolverOpts::default(),
        ));
        Ok(())
    }

    async fn handle(&mut self, event: &Event, ctx: &ModuleContext) -> EngineResult<()> {
        let domain = event.data.trim().to_ascii_lowercase();
        let prefixes = split_prefixes(ctx.option("prefixes").unwrap_or(DEFAULT_PREFIXES));
        let verify = ctx.option_bool("verify").unwrap_or(true);

        for prefix in prefixes {
            if ctx.is_cancelled() {
                break;
            }
            let host = format!("{prefix}.{domain}");
            if verify {
                let Some(resolver) = &self.resolver else {
                    break;
                };
                match resolver.lookup_ip(host.as_str()).await {
                    Ok(lookup) => {
                        let addresses: Vec<String> =
                            lookup.iter().map(|a| a.to_string()).collect();
                        if addresses.is_empty() {
                            continue;
                        }
                        ctx.cache_resolution(&host, &addresses)?;
                    }
                    Err(e) => {
                        debug!(host = %host, "no resolution: {e}");
                        continue;
                    }
                }
            }
            ctx.emit("INTERNET_NAME", &host, event).await?;
        }
        Ok(())
    }
}
