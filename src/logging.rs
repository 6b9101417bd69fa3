use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Initialize console logging. Level comes from configuration; the `RUST_LOG`
/// environment variable is not consulted.
pub fn init_logging(level: log::Level) -> anyhow::Result<()> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Cyan)
		.trace(Color::BrightBlack);

	fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:<5} [{}] {}",
				chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.level(LevelFilter::Warn)
		.level_for("bifrost_sync", level.to_level_filter())
		.chain(std::io::stdout())
		.apply()
		.map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

	Ok(())
}
