mod create;
mod kill;
mod passwd;
mod repair;
mod restart;
mod status;

use vdesk::error::Result;

use crate::cli::{Cli, Commands};
use crate::context::{self, CommandContext};

pub async fn dispatch(cli: Cli) -> Result<()> {
	let ctx = CommandContext::new(&cli)?;

	if !matches!(cli.command, Commands::SetPassword) {
		context::preflight(&ctx.cfg);
	}

	match cli.command {
		Commands::Create {
			partition,
			account,
			time_hours,
			cpus,
			mem,
			gpus,
			timeout,
			port,
			force,
		} => {
			create::run(
				&ctx,
				create::CreateArgs {
					partition,
					account,
					time_hours,
					cpus,
					mem,
					gpus,
					timeout_secs: timeout,
					port,
					force,
				},
			)
			.await
		}
		Commands::Status { format } => status::run(&ctx, format).await,
		Commands::Kill { job_id } => kill::kill_one(&ctx, &job_id).await,
		Commands::KillAll => kill::kill_all(&ctx).await,
		Commands::Repair => repair::run(&ctx).await,
		Commands::Restart { job_id } => restart::run(&ctx, &job_id).await,
		Commands::SetPassword => passwd::run(&ctx).await,
	}
}
