//! Server bootstrap: wires transport, intake, adapter and status publisher
//! together and tears them down in an order that leaves no thread behind.

use std::sync::Arc;
use std::time::Duration;

use llamadds::{DdsContext, DdsServer};
use tracing::info;

use crate::adapter::EngineAdapter;
use crate::bridge::{Bridge, ResponseSink, StatusSink};
use crate::config::BridgeConfig;
use crate::engine::CompletionEngine;
use crate::intake::IntakeQueue;
use crate::status::StatusPublisher;
use crate::BridgeError;

/// A running bridge server instance.
///
/// Startup is all-or-nothing: if any subsystem fails to come up, everything
/// already started is stopped before the error is returned.
pub struct BridgeServer {
    bridge: Arc<Bridge>,
    transport: Arc<DdsServer>,
    adapter: EngineAdapter,
    status: StatusPublisher,
}

impl BridgeServer {
    pub fn start(
        config: &BridgeConfig,
        engine: Arc<dyn CompletionEngine>,
    ) -> Result<Self, BridgeError> {
        let ctx = DdsContext::load(
            &config.dds_lib_path,
            &config.dds_types_lib_path,
            config.dds_domain,
        )?;

        let intake = Arc::new(IntakeQueue::new());
        let transport = Arc::new(DdsServer::start(&ctx, {
            let intake = Arc::clone(&intake);
            move |req| intake.handle_request(req)
        })?);

        let bridge = Arc::new(Bridge::new(
            &config.server_id,
            intake,
            Arc::clone(&transport) as Arc<dyn ResponseSink>,
        ));
        bridge.set_model_info(engine.model_name(), true, config.n_parallel);

        let adapter = EngineAdapter::spawn(
            Arc::clone(&bridge),
            engine,
            Duration::from_secs(config.dds_timeout_secs),
        )?;
        let status = match StatusPublisher::spawn(
            Arc::clone(&bridge),
            Arc::clone(&transport) as Arc<dyn StatusSink>,
            Duration::from_secs(config.status_period_secs),
        ) {
            Ok(status) => status,
            Err(e) => {
                // Unblock the adapter before its drop joins the thread.
                bridge.intake().shutdown();
                return Err(e);
            }
        };

        info!(
            server_id = %config.server_id,
            domain = config.dds_domain,
            n_parallel = config.n_parallel,
            timeout_secs = config.dds_timeout_secs,
            "bridge server started"
        );
        Ok(Self {
            bridge,
            transport,
            adapter,
            status,
        })
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Stop every owned thread and release the transport.
    ///
    /// Order matters: the intake queue shuts down first so the adapter can
    /// drain staged requests with terminal errors while the transport is
    /// still able to publish them; the transport goes last.
    pub fn stop(&mut self) {
        info!("bridge server stopping");
        self.bridge.intake().shutdown();
        self.adapter.join();
        self.status.stop();
        self.transport.stop();
        info!("bridge server stopped");
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.stop();
    }
}
