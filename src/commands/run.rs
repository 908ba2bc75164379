use crate::core::{RunReport, TransferEngine};
use crate::AppContext;
use anyhow::Result;
use tracing::{info, warn};

/// 执行一次传输：逐段处理所有 `set-` 段
pub async fn run_transfers(ctx: &AppContext) -> Result<RunReport> {
    for warning in ctx.settings.warnings() {
        warn!("{}", warning);
    }

    let rules = ctx.settings.transfer_rules(&ctx.macros);
    info!("共 {} 个传输段", rules.len());

    let session = ctx.session()?;
    let tracker = ctx.tracker();
    let mut engine = TransferEngine::new(session, tracker);

    Ok(engine.run(rules).await)
}
