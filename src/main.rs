use pds_oauth::app::{self, StartupError};

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    app::run().await
}
