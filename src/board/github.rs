//! GitHub Projects v2 board adapter.
//!
//! Talks GraphQL over reqwest. Field ids for the Status single-select and
//! the Assigned Instance text field are resolved once per process and
//! cached; no field names are hardcoded — the configuration supplies them.

use super::{Board, BoardItem, ItemFilter, ItemPage, PAGE_SIZE};
use crate::errors::BoardError;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

const GRAPHQL_URL: &str = "https://api.github.com/graphql";
const USER_AGENT: &str = "autonomous-orchestrator";

/// Connection settings for [`GithubBoard`].
#[derive(Debug, Clone)]
pub struct GithubBoardConfig {
    pub token: String,
    /// Project node id (`PVT_...`).
    pub project_id: String,
    pub owner: String,
    pub repo: String,
    /// Name of the single-select status field, usually `Status`.
    pub status_field: String,
    /// Name of the text field holding the worker instance id.
    pub instance_field: String,
    /// Per-call deadline.
    pub timeout: Duration,
}

/// Resolved field ids, fetched lazily on first write.
#[derive(Debug, Clone)]
struct ProjectFields {
    status_field_id: String,
    /// Status option name -> option id.
    status_options: HashMap<String, String>,
    instance_field_id: String,
}

pub struct GithubBoard {
    client: reqwest::Client,
    config: GithubBoardConfig,
    fields: OnceCell<ProjectFields>,
}

impl GithubBoard {
    pub fn new(config: GithubBoardConfig) -> Result<Self, BoardError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BoardError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            config,
            fields: OnceCell::new(),
        })
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, BoardError> {
        let response = self
            .client
            .post(GRAPHQL_URL)
            .bearer_auth(&self.config.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(BoardError::AuthRejected(format!("HTTP {status}")));
        }
        let body: Value = response.error_for_status()?.json().await?;

        if let Some(errors) = body.get("errors").and_then(Value::as_array)
            && !errors.is_empty()
        {
            let message = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(BoardError::Malformed(format!("GraphQL errors: {message}")));
        }

        body.get("data")
            .cloned()
            .ok_or_else(|| BoardError::Malformed("response has no data".to_string()))
    }

    async fn project_fields(&self) -> Result<&ProjectFields, BoardError> {
        self.fields
            .get_or_try_init(|| async {
                let data = self
                    .graphql(FIELDS_QUERY, json!({ "project": self.config.project_id }))
                    .await?;
                parse_project_fields(
                    &data,
                    &self.config.status_field,
                    &self.config.instance_field,
                )
            })
            .await
    }

    async fn field_value_by_name(
        &self,
        board_item_id: &str,
        field: &str,
    ) -> Result<Option<String>, BoardError> {
        let data = self
            .graphql(
                FIELD_VALUE_QUERY,
                json!({ "item": board_item_id, "field": field }),
            )
            .await?;
        let value = data
            .get("node")
            .and_then(|n| n.get("fieldValueByName"))
            .cloned()
            .unwrap_or(Value::Null);
        if value.is_null() {
            return Ok(None);
        }
        Ok(value
            .get("name")
            .or_else(|| value.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[async_trait]
impl Board for GithubBoard {
    async fn list_items(&self, filter: &ItemFilter) -> Result<ItemPage, BoardError> {
        let variables = json!({
            "project": self.config.project_id,
            "pageSize": PAGE_SIZE,
            "cursor": filter.cursor,
        });
        let data = self.graphql(ITEMS_QUERY, variables).await?;
        let mut page = parse_items_page(&data, &self.config.status_field, &self.config.instance_field)?;
        if let Some(wanted) = &filter.statuses {
            page.items.retain(|item| wanted.contains(&item.status));
        }
        debug!(items = page.items.len(), "fetched board page");
        Ok(page)
    }

    async fn get_status(&self, board_item_id: &str) -> Result<Option<String>, BoardError> {
        self.field_value_by_name(board_item_id, &self.config.status_field)
            .await
    }

    async fn set_status(&self, board_item_id: &str, status: &str) -> Result<(), BoardError> {
        let fields = self.project_fields().await?;
        let option_id = fields.status_options.get(status).ok_or_else(|| {
            BoardError::Malformed(format!(
                "board has no '{status}' option for field '{}'",
                self.config.status_field
            ))
        })?;
        self.graphql(
            UPDATE_SINGLE_SELECT_MUTATION,
            json!({
                "project": self.config.project_id,
                "item": board_item_id,
                "field": fields.status_field_id,
                "option": option_id,
            }),
        )
        .await?;
        Ok(())
    }

    async fn get_assigned_instance(
        &self,
        board_item_id: &str,
    ) -> Result<Option<String>, BoardError> {
        let value = self
            .field_value_by_name(board_item_id, &self.config.instance_field)
            .await?;
        Ok(value.filter(|v| !v.trim().is_empty()))
    }

    async fn set_assigned_instance(
        &self,
        board_item_id: &str,
        instance: Option<&str>,
    ) -> Result<(), BoardError> {
        let fields = self.project_fields().await?;
        match instance {
            Some(text) => {
                self.graphql(
                    UPDATE_TEXT_MUTATION,
                    json!({
                        "project": self.config.project_id,
                        "item": board_item_id,
                        "field": fields.instance_field_id,
                        "text": text,
                    }),
                )
                .await?;
            }
            None => {
                self.graphql(
                    CLEAR_FIELD_MUTATION,
                    json!({
                        "project": self.config.project_id,
                        "item": board_item_id,
                        "field": fields.instance_field_id,
                    }),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn get_item_for_issue(&self, issue_number: u64) -> Result<Option<String>, BoardError> {
        let data = self
            .graphql(
                ITEM_FOR_ISSUE_QUERY,
                json!({
                    "owner": self.config.owner,
                    "repo": self.config.repo,
                    "number": issue_number,
                }),
            )
            .await?;
        let nodes = data
            .get("repository")
            .and_then(|r| r.get("issue"))
            .and_then(|i| i.get("projectItems"))
            .and_then(|p| p.get("nodes"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for node in &nodes {
            let project = node
                .get("project")
                .and_then(|p| p.get("id"))
                .and_then(Value::as_str);
            if project == Some(self.config.project_id.as_str()) {
                return Ok(node
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string));
            }
        }
        Ok(None)
    }
}

/// Parse the `fields(first: 50)` response into resolved ids.
fn parse_project_fields(
    data: &Value,
    status_field: &str,
    instance_field: &str,
) -> Result<ProjectFields, BoardError> {
    let nodes = data
        .get("node")
        .and_then(|n| n.get("fields"))
        .and_then(|f| f.get("nodes"))
        .and_then(Value::as_array)
        .ok_or_else(|| BoardError::Malformed("fields query returned no nodes".to_string()))?;

    let mut status_field_id = None;
    let mut status_options = HashMap::new();
    let mut instance_field_id = None;

    for node in nodes {
        let Some(name) = node.get("name").and_then(Value::as_str) else {
            continue;
        };
        let Some(id) = node.get("id").and_then(Value::as_str) else {
            continue;
        };
        if name == status_field {
            status_field_id = Some(id.to_string());
            if let Some(options) = node.get("options").and_then(Value::as_array) {
                for option in options {
                    if let (Some(option_name), Some(option_id)) = (
                        option.get("name").and_then(Value::as_str),
                        option.get("id").and_then(Value::as_str),
                    ) {
                        status_options.insert(option_name.to_string(), option_id.to_string());
                    }
                }
            }
        } else if name == instance_field {
            instance_field_id = Some(id.to_string());
        }
    }

    Ok(ProjectFields {
        status_field_id: status_field_id.ok_or_else(|| {
            BoardError::Malformed(format!("project has no '{status_field}' field"))
        })?,
        status_options,
        instance_field_id: instance_field_id.ok_or_else(|| {
            BoardError::Malformed(format!("project has no '{instance_field}' field"))
        })?,
    })
}

/// Parse one `items(first: N)` page into the core's projection.
fn parse_items_page(
    data: &Value,
    status_field: &str,
    instance_field: &str,
) -> Result<ItemPage, BoardError> {
    let items_node = data
        .get("node")
        .and_then(|n| n.get("items"))
        .ok_or_else(|| BoardError::Malformed("items query returned no items".to_string()))?;

    let next_cursor = items_node
        .get("pageInfo")
        .filter(|p| p.get("hasNextPage").and_then(Value::as_bool) == Some(true))
        .and_then(|p| p.get("endCursor"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut items = Vec::new();
    let nodes = items_node
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for node in &nodes {
        let Some(board_item_id) = node.get("id").and_then(Value::as_str) else {
            continue;
        };
        // Draft items and pull requests have no Issue content; skip them.
        let Some(content) = node.get("content").filter(|c| !c.is_null()) else {
            continue;
        };
        let Some(issue_number) = content.get("number").and_then(Value::as_u64) else {
            continue;
        };

        let mut status = String::new();
        let mut assigned_instance = None;
        let mut field_map = HashMap::new();
        if let Some(values) = node
            .get("fieldValues")
            .and_then(|v| v.get("nodes"))
            .and_then(Value::as_array)
        {
            for value in values {
                let Some(field_name) = value
                    .get("field")
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                let rendered = value
                    .get("name")
                    .or_else(|| value.get("text"))
                    .or_else(|| value.get("title"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| value.get("number").and_then(Value::as_f64).map(|n| n.to_string()));
                let Some(rendered) = rendered else { continue };

                if field_name == status_field {
                    status = rendered;
                } else if field_name == instance_field {
                    if !rendered.trim().is_empty() {
                        assigned_instance = Some(rendered);
                    }
                } else {
                    field_map.insert(field_name.to_string(), rendered);
                }
            }
        }

        items.push(BoardItem {
            board_item_id: board_item_id.to_string(),
            issue_number,
            title: content
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            body: content
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status,
            assigned_instance,
            field_map,
        });
    }

    Ok(ItemPage { items, next_cursor })
}

const ITEMS_QUERY: &str = r#"
query($project: ID!, $pageSize: Int!, $cursor: String) {
  node(id: $project) {
    ... on ProjectV2 {
      items(first: $pageSize, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id
          content { ... on Issue { number title body } }
          fieldValues(first: 50) {
            nodes {
              ... on ProjectV2ItemFieldSingleSelectValue {
                name
                field { ... on ProjectV2FieldCommon { name } }
              }
              ... on ProjectV2ItemFieldTextValue {
                text
                field { ... on ProjectV2FieldCommon { name } }
              }
              ... on ProjectV2ItemFieldNumberValue {
                number
                field { ... on ProjectV2FieldCommon { name } }
              }
              ... on ProjectV2ItemFieldIterationValue {
                title
                field { ... on ProjectV2FieldCommon { name } }
              }
            }
          }
        }
      }
    }
  }
}"#;

const FIELDS_QUERY: &str = r#"
query($project: ID!) {
  node(id: $project) {
    ... on ProjectV2 {
      fields(first: 50) {
        nodes {
          ... on ProjectV2FieldCommon { id name }
          ... on ProjectV2SingleSelectField { id name options { id name } }
        }
      }
    }
  }
}"#;

const FIELD_VALUE_QUERY: &str = r#"
query($item: ID!, $field: String!) {
  node(id: $item) {
    ... on ProjectV2Item {
      fieldValueByName(name: $field) {
        ... on ProjectV2ItemFieldSingleSelectValue { name }
        ... on ProjectV2ItemFieldTextValue { text }
      }
    }
  }
}"#;

const UPDATE_SINGLE_SELECT_MUTATION: &str = r#"
mutation($project: ID!, $item: ID!, $field: ID!, $option: String!) {
  updateProjectV2ItemFieldValue(input: {
    projectId: $project, itemId: $item, fieldId: $field,
    value: { singleSelectOptionId: $option }
  }) { projectV2Item { id } }
}"#;

const UPDATE_TEXT_MUTATION: &str = r#"
mutation($project: ID!, $item: ID!, $field: ID!, $text: String!) {
  updateProjectV2ItemFieldValue(input: {
    projectId: $project, itemId: $item, fieldId: $field,
    value: { text: $text }
  }) { projectV2Item { id } }
}"#;

const CLEAR_FIELD_MUTATION: &str = r#"
mutation($project: ID!, $item: ID!, $field: ID!) {
  clearProjectV2ItemFieldValue(input: {
    projectId: $project, itemId: $item, fieldId: $field
  }) { projectV2Item { id } }
}"#;

const ITEM_FOR_ISSUE_QUERY: &str = r#"
query($owner: String!, $repo: String!, $number: Int!) {
  repository(owner: $owner, name: $repo) {
    issue(number: $number) {
      projectItems(first: 20) {
        nodes { id project { id } }
      }
    }
  }
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn items_fixture() -> Value {
        serde_json::json!({
            "node": {
                "items": {
                    "pageInfo": { "hasNextPage": true, "endCursor": "CUR_2" },
                    "nodes": [
                        {
                            "id": "PVTI_1",
                            "content": { "number": 42, "title": "Fix parser", "body": "details" },
                            "fieldValues": {
                                "nodes": [
                                    { "name": "Ready", "field": { "name": "Status" } },
                                    { "text": "claude-0", "field": { "name": "Assigned Instance" } },
                                    { "name": "P1", "field": { "name": "Priority" } },
                                    { "title": "Sprint 4", "field": { "name": "Iteration" } },
                                    { "number": 3.0, "field": { "name": "Size" } }
                                ]
                            }
                        },
                        {
                            "id": "PVTI_2",
                            "content": null,
                            "fieldValues": { "nodes": [] }
                        }
                    ]
                }
            }
        })
    }

    #[test]
    fn test_parse_items_page_projects_fields() {
        let page = parse_items_page(&items_fixture(), "Status", "Assigned Instance").unwrap();
        assert_eq!(page.items.len(), 1);
        let item = &page.items[0];
        assert_eq!(item.board_item_id, "PVTI_1");
        assert_eq!(item.issue_number, 42);
        assert_eq!(item.title, "Fix parser");
        assert_eq!(item.status, "Ready");
        assert_eq!(item.assigned_instance.as_deref(), Some("claude-0"));
        assert_eq!(item.field("Priority"), Some("P1"));
        assert_eq!(item.field("Iteration"), Some("Sprint 4"));
        assert_eq!(item.field("Size"), Some("3"));
        assert_eq!(page.next_cursor.as_deref(), Some("CUR_2"));
    }

    #[test]
    fn test_parse_items_page_skips_non_issue_content() {
        let page = parse_items_page(&items_fixture(), "Status", "Assigned Instance").unwrap();
        assert!(page.items.iter().all(|i| i.board_item_id != "PVTI_2"));
    }

    #[test]
    fn test_parse_items_page_last_page_has_no_cursor() {
        let data = serde_json::json!({
            "node": { "items": {
                "pageInfo": { "hasNextPage": false, "endCursor": "CUR_END" },
                "nodes": []
            } }
        });
        let page = parse_items_page(&data, "Status", "Assigned Instance").unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_parse_items_page_rejects_shapeless_response() {
        let err = parse_items_page(&serde_json::json!({}), "Status", "Assigned Instance");
        assert!(matches!(err, Err(BoardError::Malformed(_))));
    }

    fn fields_fixture() -> Value {
        serde_json::json!({
            "node": { "fields": { "nodes": [
                { "id": "F_TITLE", "name": "Title" },
                { "id": "F_STATUS", "name": "Status", "options": [
                    { "id": "OPT_READY", "name": "Ready" },
                    { "id": "OPT_WIP", "name": "In Progress" },
                    { "id": "OPT_DEV", "name": "Dev Complete" },
                    { "id": "OPT_DONE", "name": "Done" }
                ] },
                { "id": "F_INSTANCE", "name": "Assigned Instance" }
            ] } }
        })
    }

    #[test]
    fn test_parse_project_fields_resolves_ids() {
        let fields = parse_project_fields(&fields_fixture(), "Status", "Assigned Instance").unwrap();
        assert_eq!(fields.status_field_id, "F_STATUS");
        assert_eq!(fields.instance_field_id, "F_INSTANCE");
        assert_eq!(fields.status_options["Dev Complete"], "OPT_DEV");
        assert_eq!(fields.status_options.len(), 4);
    }

    #[test]
    fn test_parse_project_fields_missing_status_field() {
        let err = parse_project_fields(&fields_fixture(), "State", "Assigned Instance");
        match err {
            Err(BoardError::Malformed(msg)) => assert!(msg.contains("State")),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
