/*!
Built-in scan modules
*/

use recon_engine::{EngineResult, ModuleRegistry, ScanModule};

mod dns_resolve;
mod email_domain;
mod host_enum;
mod stdout_reporter;

pub use dns_resolve::DnsResolve;
pub use email_domain::EmailDomain;
pub use host_enum::HostEnum;
pub use stdout_reporter::StdoutReporter;

pub fn register_builtins(registry: &mut ModuleRegistry) -> EngineResult<()> {
    registry.register(|| Box::new(HostEnum::default()) as Box<dyn ScanModule>)?;
    registry.register(|| Box::new(DnsResolve::default()) as Box<dyn ScanModule>)?;
    registry.register(|| Box::new(EmailDomain::default()) as Box<dyn ScanModule>)?;
    registry.register(|| Box::new(StdoutReporter::default()) as Box<dyn ScanModule>)?;
    Ok(())
}
