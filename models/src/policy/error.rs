use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to update NodeRefresh status ('{}'): '{}'", name, source))]
    UpdateNodeRefreshStatus {
        source: Box<dyn std::error::Error + Send + Sync>,
        name: String,
    },

    #[snafu(display("NodeRefresh status must carry valid rfc3339 timestamps: '{}'", source))]
    TimestampFormat { source: chrono::ParseError },
}
