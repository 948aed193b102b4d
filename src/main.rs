use anyhow::{Context, Result};
use sun2000_modbus::config::Config;
use sun2000_modbus::telemetry::{self, init_tracing};
use sun2000_modbus::{Device, PollGroup, RegisterValue};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

fn log_values(slave: u8, source: &str, values: &[RegisterValue]) {
    match serde_json::to_string(values) {
        Ok(readings) => info!(slave, source, count = values.len(), %readings, "readings"),
        Err(e) => warn!(slave, source, error = %e, "cannot serialize readings"),
    }
}

async fn poll_loop(device: Device, group: PollGroup, extra: Vec<String>) {
    let slave = device.slave();
    let mut ticker = interval(group.default_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let extra: Vec<&str> = extra.iter().map(String::as_str).collect();

    loop {
        ticker.tick().await;
        match device.poll_group(group).await {
            Ok(values) => log_values(slave, &group.to_string(), &values),
            Err(sun2000_modbus::Error::SchedulerClosed) => break,
            Err(e) => warn!(slave, %group, error = %e, "poll failed"),
        }
        if !extra.is_empty() {
            match device.read_many(&extra).await {
                Ok(values) => log_values(slave, "extra", &values),
                Err(e) => warn!(slave, error = %e, "extra poll failed"),
            }
        }
    }
}

/// Optimizer counters are only worth polling when optimizers are fitted.
async fn has_optimizers(device: &Device) -> bool {
    match device.read("nb_optimizers").await {
        Ok(count) => count.value.as_integer().is_some_and(|n| n > 0),
        Err(e) => {
            warn!(slave = device.slave(), error = %e, "cannot read optimizer count");
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load().context("loading configuration")?;
    if cfg.session.password.is_none() {
        warn!("no installer password configured; privileged writes are disabled");
    }

    let devices = Device::connect_all(&cfg);
    info!(
        endpoint = %cfg.transport.endpoint,
        slaves = ?cfg.transport.slave_ids,
        groups = ?cfg.poll.groups,
        "starting poller"
    );

    let mut tasks = Vec::new();
    for device in &devices {
        let slave = device.slave();
        match device.read_many(&["model_name", "serial_number", "rated_power"]).await {
            Ok(identity) => log_values(slave, "identity", &identity),
            Err(e) => error!(slave, endpoint = %cfg.transport.endpoint, error = %e, "cannot identify inverter"),
        }

        let mut groups = cfg.poll.groups.clone();
        if !groups.contains(&PollGroup::Optimizers) && has_optimizers(device).await {
            groups.push(PollGroup::Optimizers);
        }
        for (i, group) in groups.into_iter().enumerate() {
            let extra = if i == 0 { cfg.poll.extra.clone() } else { Vec::new() };
            tasks.push(tokio::spawn(poll_loop(device.clone(), group, extra)));
        }
    }

    telemetry::shutdown_signal().await;
    for task in &tasks {
        task.abort();
    }
    if let Some(primary) = devices.first() {
        primary.shutdown().await.context("stopping scheduler")?;
    }

    warn!("shutdown complete");
    Ok(())
}
