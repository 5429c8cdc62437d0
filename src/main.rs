use log::{error, info};
use webhook_tester::configuration::Config;
use webhook_tester::controller::Controller;

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(config.log_level.into())
        .format_target(false)
        .init();

    info!("Starting webhook-tester v{}", env!("CARGO_PKG_VERSION"));

    let controller = match Controller::new(config).await {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = controller.run().await {
        error!("Error occured in the controller process: {}, exiting...", e);
        std::process::exit(1);
    }
}
