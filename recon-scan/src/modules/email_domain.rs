/*!
Domain extraction from email addresses
*/

use async_trait::async_trait;

use recon_engine::{EngineResult, Event, ModuleContext, ModuleDescriptor, ScanModule};

/// Restates the host part of an email address as a domain so the
/// name-oriented modules can pick it up.
#[derive(Default)]
pub struct EmailDomain;

pub fn domain_of(email: &str) -> Option<&str> {
    let (local, domain) = email.trim().split_once('@')?;
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return None;
    }
    Some(domain)
}

#[async_trait]
impl ScanModule for EmailDomain {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("email_domain", "1.0")
            .consumes(&["EMAIL_TARGET", "EMAILADDR"])
            .produces(&["DOMAIN_NAME"])
            .use_cases(&["FOOTPRINT", "INVESTIGATE", "PASSIVE"])
    }

    async fn handle(&mut self, event: &Event, ctx: &ModuleContext) -> EngineResult<()> {
        if let Some(domain) = domain_of(&event.data) {
            ctx.emit("DOMAIN_NAME", domain, event).await?;
        }
        Ok(())
    }
}
