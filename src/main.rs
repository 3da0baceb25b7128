use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;
mod manager;
mod media;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("mux_bus", log::LevelFilter::Debug)
        .filter_module("streampush", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();

    let cancel = CancellationToken::new();
    api::start_api_server(cancel.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    manager::shutdown().await;
    std::process::exit(0);
}
