//! Logging setup: `log` + `log4rs`, scoped per gateway instead of per
//! database.

use std::path::Path;

use log::LevelFilter;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::types::GatewayId;

/// Loads `log4rs.yaml` from the working directory, for deployments that
/// manage their own logging config (legacy fallback).
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let _ = log4rs::init_file("log4rs.yaml", log4rs::config::Deserializers::default());
    Ok(())
}

/// Initializes a rolling file logger scoped to one gateway:
/// `{log_dir}/gateway-{id}_logs/gateway-{id}.log`. Creates the directory
/// if missing.
///
/// # Errors
/// Returns an error if the directory cannot be created or the logger
/// fails to initialize.
pub fn init_for_gateway(gateway_id: GatewayId, log_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let name = format!("gateway-{}", gateway_id.0);
    let mut dir = log_dir.to_path_buf();
    dir.push(format!("{name}_logs"));
    std::fs::create_dir_all(&dir)?;

    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
    let log_path = dir.join(format!("{name}.log"));
    let roller = FixedWindowRoller::builder()
        .build(&format!("{}", dir.join(format!("{name}.{{}}.log")).display()), 7)?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(10 * 1024 * 1024)), Box::new(roller));
    let appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(log_path, Box::new(policy))?;

    let config = Config::builder()
        .appender(Appender::builder().build("gateway", Box::new(appender)))
        .build(Root::builder().appender("gateway").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}
