/*!
Live result reporting to standard output
*/

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::info;

use recon_engine::{
    EngineResult, Event, ModuleContext, ModuleDescriptor, OptionSpec, ScanModule,
};

/// Prints every event as it is dispatched and a per-type summary at the end
/// of the scan.
#[derive(Default)]
pub struct StdoutReporter {
    counts: BTreeMap<String, u64>,
}

pub fn format_line(event: &Event, jsonl: bool) -> String {
    if jsonl {
        serde_json::json!({
            "type": event.event_type,
            "data": event.data,
            "module": event.module,
            "risk": event.risk,
        })
        .to_string()
    } else {
        format!(
            "{:<28} {:<16} {}",
            event.event_type, event.module, event.data
        )
    }
}

#[async_trait]
impl ScanModule for StdoutReporter {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("stdout_reporter", "1.0")
            .consumes(&["*"])
            .option(
                "format",
                OptionSpec::new("text", "Output format: text or jsonl"),
            )
    }

    async fn handle(&mut self, event: &Event, ctx: &ModuleContext) -> EngineResult<()> {
        if event.event_type == "ROOT" {
            return Ok(());
        }
        let jsonl = ctx.option("format") == Some("jsonl");
        println!("{}", format_line(event, jsonl));
        *self.counts.entry(event.event_type.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn on_finish(&mut self, _ctx: &ModuleContext) -> EngineResult<()> {
        for (event_type, count) in &self.counts {
            info!(%event_type, count, "scan summary");
        }
        Ok(())
    }
}
