//! Production broker adapter over the `lapin` AMQP 0-9-1 client
//!
//! lapin performs the SASL exchange inside `connection.open`, so the
//! transport connect and the login happen in one call here. A refusal during
//! that exchange is reported as an authentication failure.

use super::{
    AckMode, BrokerChannel, BrokerConnection, BrokerError, Connector, Delivery, DeliveryStream,
    Directive, ExchangeDeclaration, ExchangeKind, PublishRequest, QueueDeclaration,
};
use crate::config::{ConnectionConfig, Credentials};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Opens lapin connections
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

/// Render the connection URI lapin expects; every component is percent-encoded
pub fn amqp_uri(config: &ConnectionConfig) -> String {
    let scheme = if config.tls { "amqps" } else { "amqp" };
    format!(
        "{}://{}:{}@{}:{}/{}?heartbeat={}",
        scheme,
        utf8_percent_encode(&config.username, NON_ALPHANUMERIC),
        utf8_percent_encode(&config.password, NON_ALPHANUMERIC),
        config.host,
        config.port,
        utf8_percent_encode(&config.vhost, NON_ALPHANUMERIC),
        config.heartbeat_secs
    )
}

fn classify_connect_error(error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::ProtocolError(_) => BrokerError::AuthenticationFailed(Box::new(error)),
        other => BrokerError::ConnectFailed(Box::new(other)),
    }
}

fn classify_directive_error(directive: Directive, error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => BrokerError::ConnectionClosed(error.to_string()),
        other => BrokerError::directive(directive, other),
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        debug!(broker = %config.address(), vhost = %config.vhost, "Opening AMQP connection");
        let connection = Connection::connect(&amqp_uri(config), ConnectionProperties::default())
            .await
            .map_err(classify_connect_error)?;

        let (closed_tx, closed) = watch::channel(None);
        connection.on_error(move |error| {
            warn!("AMQP connection error: {}", error);
            closed_tx.send_replace(Some(error.to_string()));
        });

        Ok(Arc::new(LapinConnection {
            connection,
            username: config.username.clone(),
            closed,
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    username: String,
    closed: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    /// Login already happened during connect; confirm it is still in effect
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), BrokerError> {
        if credentials.username != self.username {
            return Err(BrokerError::AuthenticationFailed(
                "credentials differ from the ones the connection was opened with".into(),
            ));
        }
        if !self.connection.status().connected() {
            return Err(BrokerError::AuthenticationFailed(
                "connection is not open".into(),
            ));
        }
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelOpenFailed(Box::new(e)))?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        let reason = match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        };
        reason
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| BrokerError::ConnectionClosed(e.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    fn exchange_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| classify_directive_error(Directive::SetQos, e))
    }

    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: exchange.durable,
            auto_delete: exchange.auto_delete,
            ..Default::default()
        };
        self.channel
            .exchange_declare(
                &exchange.name,
                Self::exchange_kind(&exchange.kind),
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_directive_error(Directive::DeclareExchange, e))
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            ..Default::default()
        };
        self.channel
            .queue_declare(&queue.name, options, FieldTable::default())
            .await
            .map(drop)
            .map_err(|e| classify_directive_error(Directive::DeclareQueue, e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_directive_error(Directive::BindQueue, e))
    }

    async fn start_consuming(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let options = BasicConsumeOptions {
            no_ack: ack_mode.no_ack(),
            ..Default::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(|e| classify_directive_error(Directive::StartConsuming, e))?;

        Ok(Box::new(LapinDeliveryStream {
            consumer,
            consumer_tag: consumer_tag.to_string(),
        }))
    }

    async fn publish(&self, request: &PublishRequest) -> Result<(), BrokerError> {
        let options = BasicPublishOptions {
            mandatory: request.mandatory,
            immediate: request.immediate,
        };
        let properties =
            BasicProperties::default().with_delivery_mode(request.delivery_mode.as_u8());

        self.channel
            .basic_publish(
                &request.exchange,
                &request.routing_key,
                options,
                &request.payload,
                properties,
            )
            .await
            .map_err(|e| classify_directive_error(Directive::Publish, e))?
            .await
            .map(drop)
            .map_err(|e| classify_directive_error(Directive::Publish, e))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| classify_directive_error(Directive::Ack, e))
    }
}

struct LapinDeliveryStream {
    consumer: Consumer,
    consumer_tag: String,
}

#[async_trait]
impl DeliveryStream for LapinDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                consumer_tag: self.consumer_tag.clone(),
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                redelivered: delivery.redelivered,
                payload: Bytes::from(delivery.data),
            })
            .map_err(|e| classify_directive_error(Directive::StartConsuming, e)),
        )
    }
}
