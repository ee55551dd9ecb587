use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to list target nodes: '{}'", source))]
    ListTargetNodes {
        source: models::node::NodeGatewayError,
    },

    #[snafu(display("Unable to persist NodeRefresh status: '{}'", source))]
    UpdateStatus {
        source: models::policy::NodeRefreshError,
    },
}
