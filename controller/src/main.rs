use std::{env, sync::Arc};

use controller::{
    controller::{error_policy, reconcile, Context},
    metrics::RefreshControllerMetrics,
    telemetry::vending_metrics,
};
use models::{
    constants::{CONTROLLER_INTERNAL_PORT, NODE_NAME_ENV_VAR},
    node::K8sNodeGateway,
    policy::{K8sPolicyClient, NodeRefresh},
    telemetry,
};

use actix_web::{web::Data, App, HttpServer};

use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{controller::Controller, watcher},
};

use opentelemetry::global;
use opentelemetry::sdk::export::metrics::aggregation;
use opentelemetry::sdk::metrics::{controllers, processors, selectors};
use snafu::ResultExt;
use tracing::{event, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, controller_error::Error>;

#[actix_web::main]
async fn main() -> Result<()> {
    telemetry::init_telemetry_from_env().context(controller_error::TelemetryInitSnafu)?;

    // Loads the in-cluster configuration when running as a pod, falling back to the local
    // kubeconfig for development.
    let k8s_client = kube::client::Client::try_default()
        .await
        .context(controller_error::ClientCreateSnafu)?;

    // The node hosting this controller is excluded from every refresh cycle; its name arrives
    // through the downward API.
    let own_node_name =
        env::var(NODE_NAME_ENV_VAR).context(controller_error::GetNodeNameSnafu)?;

    let otel_controller = controllers::basic(
        processors::factory(
            selectors::simple::histogram([1.0, 2.0, 5.0, 10.0, 20.0, 50.0]),
            aggregation::cumulative_temporality_selector(),
        )
        .with_memory(false),
    )
    .build();

    // Exporter has to be initialized before RefreshControllerMetrics in order to set up the
    // global meter provider properly.
    let exporter = opentelemetry_prometheus::exporter(otel_controller).init();
    let metrics = RefreshControllerMetrics::new(global::meter("node-refresh-operator"));

    let context = Arc::new(Context {
        gateway: K8sNodeGateway::new(k8s_client.clone()),
        policy_client: K8sPolicyClient::new(k8s_client.clone()),
        own_node_name,
        metrics,
    });

    // Watch events on NodeRefresh objects and the periodic requeue both funnel into the same
    // serialized reconciliation entry point per policy.
    let policies = Api::<NodeRefresh>::all(k8s_client);
    let refresh_controller = Controller::new(policies, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|reconciliation| async move {
            match reconciliation {
                Ok((policy, _)) => {
                    event!(Level::DEBUG, name = %policy.name, "Reconciled NodeRefresh.")
                }
                Err(err) => event!(Level::WARN, "Reconciliation error: '{}'", err),
            }
        });

    let bindaddress = match env::var("KUBERNETES_SERVICE_HOST") {
        // IPv6 format
        Ok(addr) if addr.contains(':') => "[::]",
        // IPv4 format
        _ => "0.0.0.0",
    };

    // Setup Http server to vend prometheus metrics
    let prometheus_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(exporter.clone()))
            .service(vending_metrics)
    })
    .bind(format!("{}:{}", bindaddress, CONTROLLER_INTERNAL_PORT))
    .context(controller_error::PrometheusServerSnafu)?
    .run();

    tokio::select! {
        _ = refresh_controller => {
            event!(Level::ERROR, "controller exited");
        },
        _ = prometheus_server => {
            event!(Level::ERROR, "metric server exited");
        }
    };
    Ok(())
}

pub mod controller_error {
    use models::telemetry;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display(
            "Unable to get the name of the node hosting this controller: {}",
            source
        ))]
        GetNodeName { source: std::env::VarError },

        #[snafu(display("Error running prometheus HTTP server: '{}'", source))]
        PrometheusServer { source: std::io::Error },

        #[snafu(display("Error configuring telemetry: '{}'", source))]
        TelemetryInit {
            source: telemetry::TelemetryConfigError,
        },
    }
}
