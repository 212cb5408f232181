use reactorweb::{Handled, Request, Response, Server, StatusCode};
use std::str::from_utf8;

fn echo(req: &Request, resp: &mut Response) -> Handled {
    let result = format!(
        r#"{{"url": {:?}, "body": {:?}}}"#,
        from_utf8(req.url().path()).unwrap_or(""),
        from_utf8(req.body()).unwrap_or(""),
    );

    resp.status(StatusCode::Ok)
        .header("Content-Type", "application/json")
        .body(result)
}

fn main() {
    Server::builder()
        .port(8080)
        .post("/", echo)
        .unwrap()
        .build()
        .launch()
        .unwrap();
}
