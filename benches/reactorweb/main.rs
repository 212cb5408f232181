use reactorweb::{Handled, Request, Response, Server, ServerConfig, StatusCode};

fn hello(_: &Request, resp: &mut Response) -> Handled {
    resp.status(StatusCode::Ok)
        .header("Content-Type", "text/plain")
        .body("Hello, world!")
}

// Larger buffers than the library defaults, which favor safety over raw
// throughput.
fn main() {
    Server::builder()
        .config(ServerConfig {
            port: 8080,
            max_request_size: 64 * 1024,
            max_response_size: 64 * 1024,
            ..ServerConfig::default()
        })
        .get("/", hello)
        .unwrap()
        .build()
        .launch()
        .unwrap();
}
