use catalog_ingest_lib::{cli::parse_args, commands};

#[tokio::main]
async fn main() {
    let code = commands::run(parse_args()).await;
    std::process::exit(code);
}
