use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use paho_mqtt::{Client, ConnectOptionsBuilder, CreateOptionsBuilder, Message};
use victron_ess_lib::config::MqttSection;
use victron_ess_lib::controller::BusPublisher;
use victron_ess_lib::Error;

fn generate_random_string(len: usize) -> String {
    use rand::distr::Alphanumeric;
    use rand::Rng;

    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Creates and connects a synchronous MQTT client.
///
/// The client id gets a random suffix so several daemons can share one
/// broker, and automatic reconnection is enabled. Subscriptions do not
/// survive a reconnect (clean session), so consumers re-subscribe when the
/// receiver signals a connection loss.
pub fn create_client(config: &MqttSection, client_prefix: &str) -> Result<Client> {
    let uri = format!("tcp://{}:{}", config.host, config.port);
    let create_opts = CreateOptionsBuilder::new()
        .server_uri(&uri)
        .client_id(format!("{client_prefix}-{}", generate_random_string(8)))
        .persistence(None) // In-memory persistence
        .finalize();

    let client = Client::new(create_opts)
        .with_context(|| format!("Error creating MQTT client for server: {uri}"))?;

    client.set_timeout(Duration::from_secs(10));

    let mut conn_builder = ConnectOptionsBuilder::new();
    conn_builder
        .keep_alive_interval(Duration::from_secs(30))
        .clean_session(true)
        .automatic_reconnect(Duration::from_secs(1), Duration::from_secs(30));

    if let Some(user_name) = &config.user {
        conn_builder.user_name(user_name.as_str());
    }
    if let Some(password) = &config.password {
        conn_builder.password(password.as_str());
    }
    let conn_opts = conn_builder.finalize();

    log::info!("connecting to MQTT broker {uri}");
    client
        .connect(conn_opts)
        .with_context(|| "Failed to connect to MQTT broker")?;
    log::info!("connected to MQTT broker");
    Ok(client)
}

/// QoS 0 publisher over a shared client.
pub struct MqttPublisher {
    client: Arc<Client>,
}

impl MqttPublisher {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

impl BusPublisher for MqttPublisher {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), Error> {
        self.client
            .publish(Message::new(topic, payload, 0))
            .map_err(|e| Error::Bus(e.to_string()))
    }
}
