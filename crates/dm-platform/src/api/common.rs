//! Common API types and utilities

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::infra::rate_limit::client_key;
use crate::service::ClientInfo;

const MAX_PAGE_SIZE: u32 = 200;

/// Pagination parameters
#[derive(Debug, Deserialize, ToSchema, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct PaginationParams {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 { 1 }
fn default_limit() -> u32 { 20 }

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl PaginationParams {
    pub fn page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> u32 {
        (self.page() - 1) * self.limit()
    }
}

/// Paginated response wrapper
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, page: u32, limit: u32, total: u64) -> Self {
        let total_pages = total.div_ceil(limit.max(1) as u64) as u32;
        Self {
            data,
            page,
            limit,
            total,
            total_pages,
        }
    }
}

/// Success response with optional message
#[derive(Debug, Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true, message: None }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }
}

/// Client address and user agent for session records
pub fn client_info(headers: &HeaderMap) -> ClientInfo {
    let ip = client_key(headers);
    ClientInfo {
        ip_address: (ip != crate::infra::rate_limit::UNKNOWN_CLIENT).then_some(ip),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_bounds() {
        let p = PaginationParams { page: 0, limit: 1000 };
        assert_eq!(p.page(), 1);
        assert_eq!(p.limit(), 200);
        assert_eq!(p.offset(), 0);

        let p = PaginationParams { page: 3, limit: 10 };
        assert_eq!(p.offset(), 20);
    }

    #[test]
    fn test_total_pages() {
        let r: PaginatedResponse<u8> = PaginatedResponse::new(vec![], 1, 20, 41);
        assert_eq!(r.total_pages, 3);
        let r: PaginatedResponse<u8> = PaginatedResponse::new(vec![], 1, 20, 0);
        assert_eq!(r.total_pages, 0);
    }
}
