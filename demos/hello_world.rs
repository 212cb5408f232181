use reactorweb::{Handled, Request, Response, Server, StatusCode};

fn hello(_: &Request, resp: &mut Response) -> Handled {
    resp.status(StatusCode::Ok)
        .header("Content-Type", "text/plain")
        .body("Hello, world!")
}

fn main() {
    Server::builder()
        .port(8080)
        .get("/", hello)
        .unwrap()
        .build()
        .launch()
        .unwrap();
}
