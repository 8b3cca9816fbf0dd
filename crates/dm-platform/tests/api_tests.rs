//! Platform API Integration Tests
//!
//! Drives the composed `/api/v1` router with in-memory backends.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use dm_config::GeoSettings;
use dm_platform::api::{api_router, PlatformServices};
use dm_platform::events::{DomainEventDispatcher, DomainEventPublisher, InMemoryEventBus};
use dm_platform::infra::{ClientRateLimiter, MemoryCache};
use dm_platform::repository::{MemoryRbacRepository, MemoryUserRepository, UserRepository};
use dm_platform::service::{
    AuthService, GeocodingService, JwtConfig, JwtService, LockoutPolicy, MemorySessionStore, MfaService,
    PasswordPolicy, PasswordService, RbacService, RegisterInput,
};
use dm_secrets::EnvProvider;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const PASSWORD: &str = "Sup3rSecret";

struct TestApp {
    router: Router,
    auth: Arc<AuthService>,
    bus: Arc<InMemoryEventBus>,
    tenant: Uuid,
}

async fn build_app(rate_limiter: Option<Arc<ClientRateLimiter>>) -> TestApp {
    let users: Arc<dyn UserRepository> = Arc::new(MemoryUserRepository::new());
    let bus = Arc::new(InMemoryEventBus::default());
    let publisher = Arc::new(
        DomainEventPublisher::new(Arc::new(DomainEventDispatcher::new()), "dm-platform-test")
            .with_bus(bus.clone()),
    );
    let rbac = Arc::new(RbacService::new(
        Arc::new(MemoryRbacRepository::new()),
        users.clone(),
        publisher.clone(),
    ));
    rbac.bootstrap_defaults().await.unwrap();

    let jwt = Arc::new(JwtService::new(JwtConfig {
        secret: "integration-test-secret-0123456789abcdef".to_string(),
        issuer: "dotmac".to_string(),
        audience: "dotmac-api".to_string(),
        access_ttl_secs: 900,
        refresh_ttl_secs: 3600,
        mfa_ttl_secs: 300,
    }));
    let auth = Arc::new(AuthService::new(
        users.clone(),
        rbac.clone(),
        PasswordService::new(PasswordPolicy::default()),
        jwt,
        Arc::new(MemorySessionStore::new()),
        MfaService::new("DotMac"),
        publisher,
        LockoutPolicy::default(),
    ));
    let geocoding = Arc::new(
        GeocodingService::new(
            &GeoSettings {
                nominatim_url: "http://127.0.0.1:9".to_string(),
                ..GeoSettings::default()
            },
            Arc::new(MemoryCache::new()),
        )
        .unwrap(),
    );

    let router = api_router(PlatformServices {
        auth: auth.clone(),
        rbac,
        users,
        geocoding,
        secrets: Arc::new(EnvProvider::new("DM_TEST_SECRET_")),
        rate_limiter,
    });

    TestApp {
        router,
        auth,
        bus,
        tenant: Uuid::new_v4(),
    }
}

impl TestApp {
    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn register(&self, tenant: Uuid, username: &str) -> Value {
        let (status, body) = self
            .call(
                Method::POST,
                "/api/v1/auth/register",
                None,
                Some(json!({
                    "tenantId": tenant,
                    "username": username,
                    "email": format!("{}@example.com", username),
                    "password": PASSWORD,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body
    }

    async fn login(&self, tenant: Uuid, username: &str) -> String {
        let (status, body) = self
            .call(
                Method::POST,
                "/api/v1/auth/login",
                None,
                Some(json!({
                    "tenantId": tenant,
                    "usernameOrEmail": username,
                    "password": PASSWORD,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["mfaRequired"], false);
        body["tokens"]["accessToken"].as_str().unwrap().to_string()
    }

    async fn admin_token(&self) -> String {
        self.auth
            .ensure_admin(RegisterInput {
                tenant_id: self.tenant,
                username: "root".to_string(),
                email: "root@example.com".to_string(),
                password: PASSWORD.to_string(),
                full_name: None,
            })
            .await
            .unwrap();
        self.login(self.tenant, "root").await
    }

    async fn role_id(&self, token: &str, name: &str) -> String {
        let (status, roles) = self.call(Method::GET, "/api/v1/rbac/roles", Some(token), None).await;
        assert_eq!(status, StatusCode::OK, "{}", roles);
        roles
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["name"] == name)
            .and_then(|r| r["id"].as_str())
            .unwrap()
            .to_string()
    }

    /// Registers `username` in `tenant` as tenant_admin and returns its user body and token
    async fn tenant_admin(&self, admin: &str, tenant: Uuid, username: &str) -> (Value, String) {
        let user = self.register(tenant, username).await;
        let role_id = self.role_id(admin, "tenant_admin").await;
        let (status, body) = self
            .call(
                Method::POST,
                &format!("/api/v1/rbac/users/{}/roles", user["id"].as_str().unwrap()),
                Some(admin),
                Some(json!({ "roleId": role_id })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        let token = self.login(tenant, username).await;
        (user, token)
    }
}

mod auth_tests {
    use super::*;

    #[tokio::test]
    async fn test_register_login_and_me() {
        let app = build_app(None).await;
        let mut events = app.bus.subscribe();

        let user = app.register(app.tenant, "alice").await;
        assert_eq!(user["username"], "alice");
        assert_eq!(user["tenantId"], app.tenant.to_string());

        let token = app.login(app.tenant, "alice@example.com").await;
        let (status, me) = app.call(Method::GET, "/api/v1/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["user"]["email"], "alice@example.com");
        assert_eq!(me["roles"], json!(["user"]));

        // Registration is bridged to the integration bus
        let mut types = Vec::new();
        while let Ok(event) = events.try_recv() {
            types.push(event.event_type);
        }
        assert!(types.iter().any(|t| t == "auth.user.registered"));
    }

    #[tokio::test]
    async fn test_bad_password_is_unauthorized() {
        let app = build_app(None).await;
        app.register(app.tenant, "alice").await;

        let (status, body) = app
            .call(
                Method::POST,
                "/api/v1/auth/login",
                None,
                Some(json!({"tenantId": app.tenant, "username": "alice", "password": "Wrong1pass"})),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn test_missing_and_garbage_tokens() {
        let app = build_app(None).await;
        let (status, _) = app.call(Method::GET, "/api/v1/auth/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = app.call(Method::GET, "/api/v1/auth/me", Some("not.a.jwt"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_logout_invalidates_token() {
        let app = build_app(None).await;
        app.register(app.tenant, "alice").await;
        let token = app.login(app.tenant, "alice").await;

        let (status, _) = app.call(Method::POST, "/api/v1/auth/logout", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = app.call(Method::GET, "/api/v1/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}

mod rbac_tests {
    use super::*;

    #[tokio::test]
    async fn test_regular_user_cannot_manage_roles() {
        let app = build_app(None).await;
        app.register(app.tenant, "alice").await;
        let token = app.login(app.tenant, "alice").await;

        let (status, body) = app.call(Method::GET, "/api/v1/rbac/roles", Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["category"], "AUTHORIZATION");

        let (status, body) = app
            .call(Method::GET, "/api/v1/rbac/me/permissions", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["permissions"].as_array().unwrap().contains(&json!("geo:read")));
    }

    #[tokio::test]
    async fn test_admin_creates_and_assigns_role() {
        let app = build_app(None).await;
        let admin = app.admin_token().await;
        let alice = app.register(app.tenant, "alice").await;
        let alice_id = alice["id"].as_str().unwrap().to_string();

        let (status, role) = app
            .call(
                Method::POST,
                "/api/v1/rbac/roles",
                Some(&admin),
                Some(json!({
                    "name": "support",
                    "displayName": "Support",
                    "permissions": ["users:read"],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", role);
        assert_eq!(role["tenantId"], app.tenant.to_string());

        let (status, _) = app
            .call(
                Method::POST,
                &format!("/api/v1/rbac/users/{}/roles", alice_id),
                Some(&admin),
                Some(json!({ "roleId": role["id"] })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let token = app.login(app.tenant, "alice").await;
        let (status, page) = app.call(Method::GET, "/api/v1/users", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 2);

        // A deny override beats the role grant
        let (status, _) = app
            .call(
                Method::POST,
                &format!("/api/v1/rbac/users/{}/permissions", alice_id),
                Some(&admin),
                Some(json!({ "permission": "users:read", "granted": false, "reason": "audit" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = app.call(Method::GET, "/api/v1/users", Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, grants) = app.call(Method::GET, "/api/v1/rbac/grants", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        let actions: Vec<&str> = grants
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|g| g["action"].as_str())
            .collect();
        assert!(actions.contains(&"ROLE_ASSIGN"));
        assert!(actions.contains(&"DENY"));
    }

    #[tokio::test]
    async fn test_system_roles_are_protected() {
        let app = build_app(None).await;
        let admin = app.admin_token().await;

        let (_, roles) = app.call(Method::GET, "/api/v1/rbac/roles", Some(&admin), None).await;
        let user_role = roles
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["name"] == "user")
            .unwrap()
            .clone();

        let (status, _) = app
            .call(
                Method::DELETE,
                &format!("/api/v1/rbac/roles/{}", user_role["id"].as_str().unwrap()),
                Some(&admin),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}

mod tenant_tests {
    use super::*;

    #[tokio::test]
    async fn test_tenant_admin_cannot_reach_other_tenant() {
        let app = build_app(None).await;
        let admin = app.admin_token().await;

        // Make alice tenant_admin of her own tenant
        let alice = app.register(app.tenant, "alice").await;
        let (_, roles) = app.call(Method::GET, "/api/v1/rbac/roles", Some(&admin), None).await;
        let tenant_admin = roles
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["name"] == "tenant_admin")
            .unwrap()
            .clone();
        let (status, _) = app
            .call(
                Method::POST,
                &format!("/api/v1/rbac/users/{}/roles", alice["id"].as_str().unwrap()),
                Some(&admin),
                Some(json!({ "roleId": tenant_admin["id"] })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let other_tenant = Uuid::new_v4();
        let bob = app.register(other_tenant, "bob").await;
        let token = app.login(app.tenant, "alice").await;

        let (status, _) = app
            .call(
                Method::GET,
                &format!("/api/v1/users/{}", bob["id"].as_str().unwrap()),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .call(
                Method::GET,
                &format!("/api/v1/users?tenantId={}", other_tenant),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // The superuser crosses tenants
        let (status, _) = app
            .call(
                Method::GET,
                &format!("/api/v1/users/{}", bob["id"].as_str().unwrap()),
                Some(&admin),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_tenant_admin_cannot_escalate() {
        let app = build_app(None).await;
        let admin = app.admin_token().await;
        let (alice, token) = app.tenant_admin(&admin, app.tenant, "alice").await;
        let alice_id = alice["id"].as_str().unwrap();
        let super_admin = app.role_id(&admin, "super_admin").await;

        let (status, _) = app
            .call(
                Method::POST,
                &format!("/api/v1/rbac/users/{}/roles", alice_id),
                Some(&token),
                Some(json!({ "roleId": super_admin })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .call(
                Method::POST,
                &format!("/api/v1/rbac/users/{}/permissions", alice_id),
                Some(&token),
                Some(json!({ "permission": "*", "granted": true })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Inheriting from a global admin role is the same escalation
        let (status, _) = app
            .call(
                Method::POST,
                "/api/v1/rbac/roles",
                Some(&token),
                Some(json!({ "name": "shadow", "displayName": "Shadow", "parentId": super_admin })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, role) = app
            .call(
                Method::POST,
                "/api/v1/rbac/roles",
                Some(&token),
                Some(json!({ "name": "helpdesk", "displayName": "Helpdesk", "permissions": ["users:read"] })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", role);
        let role_id = role["id"].as_str().unwrap();

        let (status, _) = app
            .call(
                Method::POST,
                &format!("/api/v1/rbac/roles/{}/permissions", role_id),
                Some(&token),
                Some(json!({ "permission": "*" })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .call(
                Method::PUT,
                &format!("/api/v1/rbac/roles/{}", role_id),
                Some(&token),
                Some(json!({ "parentId": super_admin })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Delegating what she holds still works
        let (status, body) = app
            .call(
                Method::POST,
                &format!("/api/v1/rbac/roles/{}/permissions", role_id),
                Some(&token),
                Some(json!({ "permission": "geo:read" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        let bob = app.register(Uuid::new_v4(), "bob").await;
        let token = app.login(app.tenant, "alice").await;
        let (status, _) = app
            .call(
                Method::GET,
                &format!("/api/v1/users/{}", bob["id"].as_str().unwrap()),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_deactivated_user_loses_access() {
        let app = build_app(None).await;
        let admin = app.admin_token().await;
        let alice = app.register(app.tenant, "alice").await;
        let token = app.login(app.tenant, "alice").await;

        let (status, body) = app
            .call(
                Method::POST,
                &format!("/api/v1/users/{}/deactivate", alice["id"].as_str().unwrap()),
                Some(&admin),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isActive"], false);

        let (status, _) = app.call(Method::GET, "/api/v1/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}

mod misc_tests {
    use super::*;

    #[tokio::test]
    async fn test_secrets_round_trip_for_admin() {
        let app = build_app(None).await;
        let admin = app.admin_token().await;

        let (status, _) = app
            .call(
                Method::PUT,
                "/api/v1/secrets/smtp/password",
                Some(&admin),
                Some(json!({ "value": "hunter2" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = app
            .call(Method::GET, "/api/v1/secrets/smtp/password", Some(&admin), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], "hunter2");
        assert_eq!(body["key"], "smtp/password");
    }

    #[tokio::test]
    async fn test_secrets_isolated_between_tenants() {
        let app = build_app(None).await;
        let admin = app.admin_token().await;
        let tenant_a = Uuid::new_v4();
        let (_, alice) = app.tenant_admin(&admin, tenant_a, "alice").await;
        let (_, bob) = app.tenant_admin(&admin, Uuid::new_v4(), "bob").await;

        let (status, _) = app
            .call(
                Method::PUT,
                "/api/v1/secrets/smtp/password",
                Some(&alice),
                Some(json!({ "value": "alice-secret" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = app
            .call(Method::GET, "/api/v1/secrets/smtp/password", Some(&bob), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app
            .call(Method::DELETE, "/api/v1/secrets/smtp/password", Some(&bob), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = app
            .call(Method::GET, "/api/v1/secrets/smtp/password", Some(&alice), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], "alice-secret");

        // The superuser sees the tenant subtree
        let (status, body) = app
            .call(
                Method::GET,
                &format!("/api/v1/secrets/tenants/{}/smtp/password", tenant_a),
                Some(&admin),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], "alice-secret");
    }

    #[tokio::test]
    async fn test_secrets_need_permission() {
        let app = build_app(None).await;
        app.register(app.tenant, "alice").await;
        let token = app.login(app.tenant, "alice").await;

        let (status, _) = app
            .call(Method::GET, "/api/v1/secrets/smtp/password", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_geo_validates_coordinates() {
        let app = build_app(None).await;
        app.register(app.tenant, "alice").await;
        let token = app.login(app.tenant, "alice").await;

        let (status, body) = app
            .call(Method::GET, "/api/v1/geo/reverse?lat=95&lon=0", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"]["field"], "lat");
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let app = build_app(Some(Arc::new(ClientRateLimiter::new(60, 2)))).await;

        for _ in 0..2 {
            let (status, _) = app.call(Method::GET, "/api/v1/auth/me", None, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        let (status, body) = app.call(Method::GET, "/api/v1/auth/me", None, None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "RATE_LIMITED");
    }
}
