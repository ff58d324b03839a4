//! GraphQL search response decoding

use crate::github::{Cursor, Page, QueryError, Record};
use crate::state::QuotaSnapshot;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Search query sent with every page request
pub const SEARCH_QUERY: &str = r#"
query ($cursor: String, $searchQuery: String!, $first: Int!) {
  search(query: $searchQuery, type: REPOSITORY, first: $first, after: $cursor) {
    pageInfo {
      hasNextPage
      endCursor
    }
    nodes {
      ... on Repository {
        id
        name
        owner { login }
        stargazerCount
      }
    }
  }
  rateLimit {
    remaining
    resetAt
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<SearchData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    search: Option<SearchConnection>,
    rate_limit: Option<RateLimitNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchConnection {
    page_info: PageInfo,
    nodes: Vec<Option<RepositoryNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    id: String,
    name: String,
    owner: OwnerNode,
    stargazer_count: u64,
}

#[derive(Debug, Deserialize)]
struct OwnerNode {
    login: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitNode {
    remaining: u32,
    reset_at: DateTime<Utc>,
}

/// A decoded response: the quota signal is kept even when the page failed
#[derive(Debug)]
pub struct Decoded {
    pub quota: Option<QuotaSnapshot>,
    pub result: Result<Page, QueryError>,
}

/// Decodes a 2xx response body into a page
///
/// * `null` nodes are skipped
/// * `next_cursor` is set only while `hasNextPage` is true
/// * GraphQL errors of type `RATE_LIMITED` classify as rate limiting, every
///   other GraphQL error as a malformed response
pub fn decode_response(body: &str, observed_at: DateTime<Utc>) -> Decoded {
    let response: GraphQlResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            return Decoded {
                quota: None,
                result: Err(QueryError::Malformed(format!("invalid JSON: {}", e))),
            }
        }
    };

    let quota = response
        .data
        .as_ref()
        .and_then(|d| d.rate_limit.as_ref())
        .map(|r| QuotaSnapshot::new(r.remaining, r.reset_at));

    let result = if !response.errors.is_empty() {
        Err(classify_graphql_errors(&response.errors))
    } else {
        match response.data.and_then(|d| d.search) {
            Some(search) => into_page(search, quota, observed_at),
            None => Err(QueryError::Malformed(
                "response has no search data".to_string(),
            )),
        }
    };

    Decoded { quota, result }
}

fn classify_graphql_errors(errors: &[GraphQlError]) -> QueryError {
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");

    if errors
        .iter()
        .any(|e| e.kind.as_deref() == Some("RATE_LIMITED"))
    {
        QueryError::RateLimited(message)
    } else {
        QueryError::Malformed(format!("GraphQL error: {}", message))
    }
}

fn into_page(
    search: SearchConnection,
    quota: Option<QuotaSnapshot>,
    observed_at: DateTime<Utc>,
) -> Result<Page, QueryError> {
    let next_cursor = if search.page_info.has_next_page {
        match search.page_info.end_cursor {
            Some(token) if !token.is_empty() => Some(Cursor::new(token)),
            _ => {
                return Err(QueryError::Malformed(
                    "hasNextPage is true but endCursor is missing".to_string(),
                ))
            }
        }
    } else {
        None
    };

    let records = search
        .nodes
        .into_iter()
        .flatten()
        .map(|node| Record {
            stable_id: node.id,
            owner: node.owner.login,
            name: node.name,
            popularity_count: node.stargazer_count,
            observed_at,
        })
        .collect();

    Ok(Page {
        records,
        next_cursor,
        quota,
    })
}
