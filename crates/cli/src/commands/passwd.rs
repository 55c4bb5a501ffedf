//! `set-password`: hand the terminal to the display server's password
//! tool, through the container image when one is configured.

use vdesk::error::{Result, VdeskError};
use vdesk::session::password_command;

use crate::context::CommandContext;

pub async fn run(ctx: &CommandContext) -> Result<()> {
	let command = password_command(&ctx.cfg);
	println!("Setting desktop session password...");

	let status = tokio::process::Command::new("sh").arg("-c").arg(&command).status().await?;
	if status.success() {
		Ok(())
	} else {
		Err(VdeskError::Remote(format!("password tool exited with {status}")))
	}
}
