//! A small HTTP sidecar on `httpAddr`: liveness for load balancers and a
//! version endpoint for operators.

use std::net::SocketAddr;

use warp::Filter;

pub fn routes(
    version: &'static str,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let healthz = warp::path("healthz")
        .and(warp::get())
        .map(|| "ok");
    let version = warp::path("version")
        .and(warp::get())
        .map(move || warp::reply::json(&serde_json::json!({ "version": version })));
    healthz.or(version)
}

pub async fn serve(addr: SocketAddr, version: &'static str) {
    warp::serve(routes(version)).run(addr).await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn healthz_answers_ok() {
        let response = warp::test::request()
            .method("GET")
            .path("/healthz")
            .reply(&routes("0.0.0"))
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), "ok");
    }

    #[tokio::test]
    async fn version_reports_the_build() {
        let response = warp::test::request()
            .method("GET")
            .path("/version")
            .reply(&routes("1.2.3"))
            .await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["version"], "1.2.3");
    }
}
