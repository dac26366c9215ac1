use std::time::Duration;

use anyhow::anyhow;
use loadrig_core::{
    Config, HttpRequest, IterationError, Scenario, ScenarioFuture, SetupContext, SetupError,
    SharedContext, VuContext,
};
use serde_json::json;

const LOGIN_EMAIL: &str = "loadtest@example.com";
const LOGIN_PASSWORD: &str = "loadtest123";
const TENANT: &str = "loadtest";

/// Scripted business scenario: health check, user lookup, inventory and
/// invoice browsing with occasional creates, and a rare AI chat call.
/// Create and AI operations are probability-gated so the request mix stays
/// realistic at any VU count.
pub struct ApiScenario {
    base_url: String,
}

impl ApiScenario {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.target.base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_headers(&self, shared: &SharedContext) -> Vec<(String, String)> {
        let token = shared["token"].as_str().unwrap_or_default();
        vec![
            ("Authorization".to_string(), format!("Bearer {token}")),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("X-Tenant-ID".to_string(), format!("{TENANT}-tenant")),
        ]
    }

    async fn health_check(&self, vu: &VuContext) -> Result<(), IterationError> {
        let req = HttpRequest::get(self.url("/health")).headers(self.auth_headers(vu.shared()));
        let res = vu.request(&req).await?;

        let ok = vu.check("health check status is 200", res.status == 200)
            & vu.check(
                "health check response time < 100ms",
                res.duration < Duration::from_millis(100),
            );
        vu.metrics().add_rate("errors", !ok);
        vu.metrics().add_trend("api_latency", millis(res.duration));
        Ok(())
    }

    async fn user_ops(&self, vu: &VuContext) -> Result<(), IterationError> {
        let req = HttpRequest::get(self.url("/users/me")).headers(self.auth_headers(vu.shared()));
        let res = vu.request(&req).await?;

        vu.check("get user status is 200", res.status == 200);
        vu.metrics().add_trend("api_latency", millis(res.duration));
        vu.sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn inventory_ops(&self, vu: &VuContext) -> Result<(), IterationError> {
        let req = HttpRequest::get(self.url("/inventory?page=1&per_page=20"))
            .headers(self.auth_headers(vu.shared()));
        let res = vu.request(&req).await?;

        vu.check("list inventory status is 200", res.status == 200);
        vu.check(
            "inventory loads in < 200ms",
            res.duration < Duration::from_millis(200),
        );
        vu.metrics().add_trend("api_latency", millis(res.duration));
        vu.sleep(Duration::from_secs(2)).await;

        // Create inventory item (10% of iterations)
        if vu.chance(0.1) {
            let body = json!({
                "sku": format!("SKU-{}-{}", vu.vu_id(), vu.iteration()),
                "name": format!("Test Product {}", vu.vu_id()),
                "description": "Load test product",
                "category": "test",
                "initial_quantity": 100,
                "unit_cost": 10.00,
                "unit_price": 20.00,
            })
            .to_string();
            let req = HttpRequest::post(self.url("/inventory"), body)
                .headers(self.auth_headers(vu.shared()));
            let res = vu.request(&req).await?;

            vu.check("create inventory succeeded", res.is_success());
            vu.metrics().add_trend("api_latency", millis(res.duration));
        }
        Ok(())
    }

    async fn invoice_ops(&self, vu: &VuContext) -> Result<(), IterationError> {
        let req = HttpRequest::get(self.url("/invoices?page=1&per_page=20"))
            .headers(self.auth_headers(vu.shared()));
        let res = vu.request(&req).await?;

        vu.check("list invoices status is 200", res.status == 200);
        vu.metrics().add_trend("api_latency", millis(res.duration));
        vu.sleep(Duration::from_secs(2)).await;

        // Create invoice (5% of iterations)
        if vu.chance(0.05) {
            let body = json!({
                "customer_id": "cust_loadtest",
                "line_items": [
                    { "description": "Load Test Service", "quantity": 1, "unit_price": 100.00 },
                ],
                "tax_rate": 0.08,
            })
            .to_string();
            let req = HttpRequest::post(self.url("/invoices"), body)
                .headers(self.auth_headers(vu.shared()));
            let res = vu.request(&req).await?;

            vu.check("create invoice succeeded", res.is_success());
            vu.metrics().add_trend("api_latency", millis(res.duration));
        }
        Ok(())
    }

    async fn ai_ops(&self, vu: &VuContext) -> Result<(), IterationError> {
        // AI chat (1% of iterations, the calls are expensive)
        if vu.chance(0.01) {
            let body = json!({
                "message": "What are my top selling products?",
                "model": "gpt-3.5-turbo",
                "max_tokens": 150,
            })
            .to_string();
            let req =
                HttpRequest::post(self.url("/ai/chat"), body).headers(self.auth_headers(vu.shared()));
            let res = vu.request(&req).await?;

            vu.check("AI response succeeded", res.is_success());
            vu.check(
                "AI response time < 5s",
                res.duration < Duration::from_secs(5),
            );
            vu.metrics().add_trend("ai_latency", millis(res.duration));
        }
        Ok(())
    }
}

impl Scenario for ApiScenario {
    fn name(&self) -> &'static str {
        "api-load"
    }

    fn setup<'a>(
        &'a self,
        cx: &'a SetupContext,
    ) -> ScenarioFuture<'a, Result<SharedContext, SetupError>> {
        Box::pin(async move {
            let body = json!({
                "email": LOGIN_EMAIL,
                "password": LOGIN_PASSWORD,
                "tenant_subdomain": TENANT,
            })
            .to_string();
            let req = HttpRequest::post(self.url("/auth/login"), body)
                .header("Content-Type", "application/json");

            let res = cx
                .request(&req)
                .await
                .map_err(|err| SetupError::from(anyhow!(err)))?;
            if !cx.check("login successful", res.is_success()) {
                return Err(SetupError::msg(format!(
                    "login returned status {}",
                    res.status
                )));
            }

            let token = res
                .json()
                .and_then(|body| body["data"]["access_token"].as_str().map(str::to_string))
                .ok_or_else(|| SetupError::msg("login response had no access token"))?;
            Ok(json!({ "token": token }))
        })
    }

    fn iteration<'a>(
        &'a self,
        vu: &'a VuContext,
    ) -> ScenarioFuture<'a, Result<(), IterationError>> {
        Box::pin(async move {
            self.health_check(vu).await?;
            self.user_ops(vu).await?;
            self.inventory_ops(vu).await?;
            self.invoice_ops(vu).await?;
            self.ai_ops(vu).await?;
            vu.sleep(Duration::from_secs(1)).await;
            Ok(())
        })
    }

    fn teardown<'a>(
        &'a self,
        cx: &'a SetupContext,
        shared: &'a SharedContext,
    ) -> ScenarioFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            // Cleanup test data
            let req =
                HttpRequest::delete(self.url("/loadtest/cleanup")).headers(self.auth_headers(shared));
            cx.request(&req).await?;
            Ok(())
        })
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
