//! Built-in job handlers.

use async_trait::async_trait;
use tracing::info;

use crate::registry::{HandlerRegistry, JobContext, JobHandler};

pub const BUILTIN_ASSEMBLY: &str = "Cadence.Jobs";

/// Prints the current time and the run parameters. Useful as a smoke-test
/// job and as a template for real handlers.
pub struct ConsoleWriteJob;

impl ConsoleWriteJob {
    pub const CLASS: &'static str = "ConsoleWriteJob";

    fn render(ctx: &JobContext) -> String {
        format!(
            "[{}] {}/{}: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
            ctx.job_group,
            ctx.job_name,
            ctx.run_params
        )
    }
}

#[async_trait]
impl JobHandler for ConsoleWriteJob {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        println!("{}", Self::render(&ctx));
        info!(job_id = %ctx.job_id, fired_at = %ctx.fired_at, "console write job ran");
        Ok(())
    }
}

/// Register every built-in handler under [`BUILTIN_ASSEMBLY`].
pub fn register_builtin(registry: &mut HandlerRegistry) -> &mut HandlerRegistry {
    registry.register(BUILTIN_ASSEMBLY, ConsoleWriteJob::CLASS, ConsoleWriteJob)
}
