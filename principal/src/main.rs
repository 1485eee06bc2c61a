use dotenv::dotenv;
use tracing_subscriber::EnvFilter;

fn main() {
    // dotenv is optional in most deployments; a missing `.env` is not fatal.
    let _ = dotenv();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    tracing::info!("principal pipeline ready; call principal::build_instance_op from a scheduler loop");
}
