mod adjust;
mod config;
mod et;
mod history;
mod mqtt;
mod relay;
mod schedule;
mod scheduler;
mod state;
mod weather;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use config::RainSensorKind;
use history::{Db, History};
use mqtt::{extract_station, extract_zone_id, parse_zone_command, ZoneCommand, FAULT_TOPIC};
use relay::{BoardLayout, RelayBoard};
use scheduler::{Command, Scheduler, SchedulerIo};
use state::{CriticalFault, SystemState};
use weather::{MqttWeatherSource, WeatherObservation, WeatherPoller};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:sprinkler.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (zones, schedules, adjustment) ──────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    let zones = cfg.zone_table();
    if zones.is_empty() {
        warn!("no zones configured");
    }
    for z in db.load_zones().await? {
        if !zones.iter().any(|c| c.id == z.id) {
            info!(zone = z.id, name = %z.name, "zone has history but is no longer configured");
        }
    }

    let history = History::open(db).await?;
    info!(zones = zones.len(), schedules = cfg.schedules.len(), "db ready");

    // ── Relay board ─────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let rain_pin = match cfg.rain_sensor.kind {
        RainSensorKind::Hardware => cfg.rain_sensor.pin.and_then(|p| u8::try_from(p).ok()),
        _ => None,
    };
    let layout = BoardLayout {
        zones: zones
            .iter()
            .filter(|z| z.enabled)
            .map(|z| (z.id, z.gpio_pin))
            .collect(),
        active_low,
        rain_pin,
    };
    let relays = RelayBoard::new(&layout).context("relay board init failed")?;

    // ── Shared state (read-only projection for web) ─────────────────
    let shared = SystemState::shared(&zones);
    shared.write().await.record_system("hub started".to_string());

    // ── Weather ─────────────────────────────────────────────────────
    let weather_source = MqttWeatherSource::new();
    let (poller, weather_rx) = WeatherPoller::new(weather_source.clone(), &cfg.weather);
    tokio::spawn(poller.run());

    // ── Scheduler ───────────────────────────────────────────────────
    let (fault_tx, fault_rx) = broadcast::channel::<CriticalFault>(32);
    let io = SchedulerIo {
        weather: weather_rx,
        shared: shared.clone(),
        faults: fault_tx,
    };
    let web_history = history.reader();
    let mut sched = Scheduler::new(&cfg, relays, history, io)?;
    sched.recover(OffsetDateTime::now_utc()).await?;

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(32);
    let sched_task = tokio::spawn(sched.run(cmd_rx));

    // ── Web server ──────────────────────────────────────────────────
    let app_state = web::AppState {
        shared: shared.clone(),
        history: web_history,
        commands: cmd_tx.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app_state).await {
            error!(error = %e, "web server stopped");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let client_id = "sprinkler-hub";
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    let station = cfg.weather.station.clone();
    let weather_topic = mqtt::weather_filter(station.as_deref());
    client.subscribe(&weather_topic, QoS::AtLeastOnce).await?;
    client.subscribe("zone/+/set", QoS::AtLeastOnce).await?;
    info!(weather = %weather_topic, "hub subscribed to weather and zone/+/set");

    tokio::spawn(forward_faults(fault_rx, client.clone()));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.clone();

                if let Some(from) = extract_station(&topic) {
                    if station.as_deref().is_some_and(|s| s != from) {
                        debug!(station = from, "ignoring observation from other station");
                        continue;
                    }
                    match serde_json::from_slice::<WeatherObservation>(&p.payload) {
                        Ok(obs) => {
                            debug!(station = from, ts = %obs.timestamp, "weather observation");
                            weather_source.publish(obs).await;
                        }
                        Err(e) => {
                            warn!(error = %e, %topic, "bad observation json");
                            shared
                                .write()
                                .await
                                .record_error(format!("bad observation json: {e}"));
                        }
                    }
                } else if let Some(zone_id) = extract_zone_id(&topic) {
                    let cmd = match parse_zone_command(&p.payload) {
                        Ok(ZoneCommand::On { duration_sec }) => Command::StartZone {
                            zone_id,
                            duration_sec,
                            reply: None,
                        },
                        Ok(ZoneCommand::Off) => Command::StopZone {
                            zone_id,
                            reply: None,
                        },
                        Err(msg) => {
                            warn!(zone = zone_id, "{msg} (use ON <secs> / OFF)");
                            shared.write().await.record_error(msg);
                            continue;
                        }
                    };
                    if cmd_tx.send(cmd).await.is_err() {
                        error!("scheduler is gone, dropping zone command");
                    }
                } else {
                    debug!(%topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                // Running zones keep their programmed duration; the scheduler
                // does not depend on the broker.
                warn!(error = %e, "mqtt error, reconnecting");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    info!("shutdown requested, closing all valves");
    let (done_tx, done_rx) = oneshot::channel();
    if cmd_tx.send(Command::Shutdown { done: done_tx }).await.is_ok() {
        let _ = done_rx.await;
    }
    let _ = sched_task.await;
    info!("hub stopped");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Log every critical fault and republish it for whoever watches the broker.
async fn forward_faults(mut rx: broadcast::Receiver<CriticalFault>, client: AsyncClient) {
    loop {
        match rx.recv().await {
            Ok(fault) => {
                error!(
                    zone = fault.zone_id,
                    attempt = fault.attempt,
                    error = %fault.error,
                    "CRITICAL: valve failed to close"
                );
                let payload = mqtt::fault_payload(&fault);
                if let Err(e) = client
                    .publish(FAULT_TOPIC, QoS::AtLeastOnce, false, payload)
                    .await
                {
                    warn!(error = %e, "fault publish failed");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "fault forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
