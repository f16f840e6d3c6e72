use station_bus::bootstrap::run_bootstrap;
use station_bus::utils::error::BusResult;

#[tokio::main]
async fn main() -> BusResult<()> {
    run_bootstrap().await
}
