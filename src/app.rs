use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{error, response::ApiResponse, state::AppState, users};

async fn health() -> ApiResponse<&'static str> {
    ApiResponse::ok("ok", "Health check passed")
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .merge(users::router())
                .route("/health", get(health)),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!("http_request", %method, uri = %uri, status = tracing::field::Empty)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        let latency_ms = latency.as_millis() as u64;
                        if status.is_server_error() {
                            tracing::error!(%status, latency_ms, "response");
                        } else {
                            tracing::info!(%status, latency_ms, "response");
                        }
                    },
                ),
        )
        .layer(CatchPanicLayer::custom(error::panic_response))
}

pub async fn serve(app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        std::env::var("APP_PORT").unwrap_or_else(|_| "8000".into())
    )
    .parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, Response, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const BOUNDARY: &str = "vidtube-test-boundary";

    fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (name, filename, content_type) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(b"\x89PNG fake image bytes");
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(method: &str, uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, cookie: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(c) = cookie {
            builder = builder.header(header::COOKIE, c);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(res: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn set_cookie(res: &Response<Body>, name: &str) -> Option<String> {
        res.headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    }

    async fn register_jane(app: &Router) -> Response<Body> {
        let body = multipart_body(
            &[
                ("fullName", "Jane"),
                ("email", "jane@x.com"),
                ("username", "Jane"),
                ("password", "secret123"),
            ],
            &[("avatar", "me.png", "image/png")],
        );
        app.clone()
            .oneshot(multipart_request("POST", "/api/v1/users/register", body))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build_app(AppState::fake());
        let res = app
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        assert_eq!(json["data"], "ok");
        assert_eq!(json["success"], true);
    }

    #[tokio::test]
    async fn session_lifecycle_end_to_end() {
        let app = build_app(AppState::fake());

        let res = register_jane(&app).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let json = body_json(res).await;
        assert_eq!(json["statusCode"], 201);
        assert_eq!(json["data"]["username"], "jane");
        assert!(json["data"].get("password").is_none());
        assert!(json["data"].get("refreshToken").is_none());

        let res = app
            .clone()
            .oneshot(json_request(
                "/api/v1/users/login",
                None,
                json!({ "username": "jane", "password": "secret123" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let access = set_cookie(&res, "accessToken").expect("access cookie");
        let refresh = set_cookie(&res, "refreshToken").expect("refresh cookie");
        let json = body_json(res).await;
        assert_eq!(json["data"]["user"]["username"], "jane");
        assert_eq!(json["data"]["accessToken"], access.as_str());
        assert_eq!(json["data"]["refreshToken"], refresh.as_str());

        let res = app
            .clone()
            .oneshot(
                Request::get("/api/v1/users/current-user")
                    .header(header::AUTHORIZATION, format!("Bearer {access}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["data"]["email"], "jane@x.com");

        let res = app
            .clone()
            .oneshot(json_request(
                "/api/v1/users/refresh-token",
                Some(&format!("refreshToken={refresh}")),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let new_access = set_cookie(&res, "accessToken").expect("rotated access cookie");
        let new_refresh = set_cookie(&res, "refreshToken").expect("rotated refresh cookie");
        assert_ne!(new_access, access);
        assert_ne!(new_refresh, refresh);

        let res = app
            .clone()
            .oneshot(json_request(
                "/api/v1/users/logout",
                Some(&format!("accessToken={new_access}")),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .all(|v| v.to_str().unwrap().contains("Max-Age=0")));
        assert_eq!(body_json(res).await["data"], Value::Null);

        let res = app
            .clone()
            .oneshot(json_request(
                "/api/v1/users/refresh-token",
                None,
                json!({ "refreshToken": new_refresh }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(res).await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let app = build_app(AppState::fake());
        assert_eq!(register_jane(&app).await.status(), StatusCode::CREATED);
        let res = register_jane(&app).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn register_without_avatar_is_rejected() {
        let app = build_app(AppState::fake());
        let body = multipart_body(
            &[
                ("fullName", "Jane"),
                ("email", "jane@x.com"),
                ("username", "jane"),
                ("password", "secret123"),
            ],
            &[],
        );
        let res = app
            .oneshot(multipart_request("POST", "/api/v1/users/register", body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(res).await["message"], "Avatar file is required");
    }

    #[tokio::test]
    async fn protected_routes_require_a_token() {
        let app = build_app(AppState::fake());
        let res = app
            .oneshot(
                Request::get("/api/v1/users/current-user")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(res).await["message"], "Unauthorized request");
    }

    async fn current_user_with_bearer(app: Router, token: &str) -> Response<Body> {
        app.oneshot(
            Request::get("/api/v1/users/current-user")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn refresh_token_is_not_accepted_as_access_token() {
        let app = build_app(AppState::fake());
        assert_eq!(register_jane(&app).await.status(), StatusCode::CREATED);
        let res = app
            .clone()
            .oneshot(json_request(
                "/api/v1/users/login",
                None,
                json!({ "username": "jane", "password": "secret123" }),
            ))
            .await
            .unwrap();
        let refresh = set_cookie(&res, "refreshToken").expect("refresh cookie");

        let res = current_user_with_bearer(app, &refresh).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(res).await["message"], "Invalid access token");
    }

    #[tokio::test]
    async fn access_token_for_deleted_user_is_rejected() {
        let state = AppState::fake();
        let ghost = crate::users::repo_types::tests::sample_user("ghost");
        let token = state.keys.sign_access(&ghost).unwrap();
        let app = build_app(state);

        let res = current_user_with_bearer(app, &token).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(res).await["success"], false);
    }

    #[tokio::test]
    async fn oversized_upload_is_payload_too_large() {
        let app = build_app(AppState::fake());
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"avatar\"; filename=\"big.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.resize(body.len() + 11 * 1024 * 1024, b'x');
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let res = app
            .oneshot(multipart_request("POST", "/api/v1/users/register", body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(res).await["success"], false);
    }

    #[tokio::test]
    async fn malformed_login_body_is_a_validation_error() {
        let app = build_app(AppState::fake());
        let res = app
            .oneshot(
                Request::post("/api/v1/users/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(res).await["success"], false);
    }

    #[tokio::test]
    async fn avatar_update_replaces_url() {
        let app = build_app(AppState::fake());
        let registered = body_json(register_jane(&app).await).await;
        let old_avatar = registered["data"]["avatar"].as_str().unwrap().to_string();

        let res = app
            .clone()
            .oneshot(json_request(
                "/api/v1/users/login",
                None,
                json!({ "email": "jane@x.com", "password": "secret123" }),
            ))
            .await
            .unwrap();
        let access = set_cookie(&res, "accessToken").unwrap();

        let body = multipart_body(&[], &[("avatar", "new.png", "image/png")]);
        let mut req = multipart_request("PATCH", "/api/v1/users/avatar", body);
        req.headers_mut().insert(
            header::COOKIE,
            format!("accessToken={access}").parse().unwrap(),
        );
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        let new_avatar = json["data"]["avatar"].as_str().unwrap();
        assert_ne!(new_avatar, old_avatar);
        assert!(new_avatar.starts_with("https://fake.local/media/"));
    }
}
