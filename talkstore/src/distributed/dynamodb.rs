//! DynamoDbClient - `KeyValueClient` over Amazon DynamoDB.
//!
//! `TigerStyle`: One SDK client per process, loaded on first use. Service
//! errors are classified once, here, into the storage error taxonomy.
//!
//! Items are plain JSON objects; attributes map one to one (`S`, `N`, `BOOL`,
//! `NULL`, `L`, `M`). Residual filter predicates are evaluated on each page
//! after it is read, which is the point where the service applies a filter
//! expression, so paging behaves the same as the in-process client.
//! Page cursors are the service's `LastEvaluatedKey` encoded as JSON.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::describe_table::DescribeTableError;
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, ReturnValue, WriteRequest};
use aws_sdk_dynamodb::Client;
use serde_json::Value;
use tokio::sync::OnceCell;

use super::client::{Condition, IndexQuery, Item, KeyValueClient, Page, TableDescription};
use super::schema::PARTITION_KEY;
use crate::config::DistributedConfig;
use crate::constants::DISTRIBUTED_BATCH_ITEMS_COUNT_MAX;
use crate::error::{StorageError, StorageResult, TransientKind};
use crate::query::Filter;

type AttributeMap = HashMap<String, AttributeValue>;

// =============================================================================
// DynamoDbClient
// =============================================================================

/// Key-value client for DynamoDB (or DynamoDB Local via an endpoint override).
///
/// Credentials come from the default provider chain (environment, profile,
/// instance role).
#[derive(Debug)]
pub struct DynamoDbClient {
    region: String,
    endpoint: Option<String>,
    client: OnceCell<Client>,
}

impl DynamoDbClient {
    /// Client for the region and endpoint of `config`.
    #[must_use]
    pub fn new(config: &DistributedConfig) -> Self {
        Self {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            client: OnceCell::new(),
        }
    }

    /// Wrap an already configured SDK client.
    #[must_use]
    pub fn from_sdk_client(client: Client) -> Self {
        Self {
            region: client.config().region().map(ToString::to_string).unwrap_or_default(),
            endpoint: None,
            client: OnceCell::new_with(Some(client)),
        }
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.region.clone()));
                if let Some(endpoint) = &self.endpoint {
                    loader = loader.endpoint_url(endpoint.clone());
                }
                let sdk_config = loader.load().await;
                tracing::info!(
                    region = %self.region,
                    endpoint = self.endpoint.as_deref().unwrap_or("default"),
                    "dynamodb client configured"
                );
                Client::new(&sdk_config)
            })
            .await
    }
}

#[async_trait]
impl KeyValueClient for DynamoDbClient {
    async fn describe_table(&self, table: &str) -> StorageResult<Option<TableDescription>> {
        let result = self.client().await.describe_table().table_name(table).send().await;
        match result {
            Ok(output) => Ok(output.table().map(|t| TableDescription {
                name: t.table_name().unwrap_or(table).to_string(),
                indexes: t
                    .global_secondary_indexes()
                    .iter()
                    .filter_map(|index| index.index_name())
                    .map(str::to_string)
                    .collect(),
                item_count: t
                    .item_count()
                    .map_or(0, |count| usize::try_from(count).unwrap_or(0)),
            })),
            Err(e)
                if e.as_service_error()
                    .is_some_and(DescribeTableError::is_resource_not_found_exception) =>
            {
                Ok(None)
            }
            Err(e) => Err(classify("describe_table", e)),
        }
    }

    async fn get_item(&self, table: &str, id: &str) -> StorageResult<Option<Item>> {
        let output = self
            .client()
            .await
            .get_item()
            .table_name(table)
            .key(PARTITION_KEY, AttributeValue::S(id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify("get_item", e))?;
        output.item().map(from_attributes).transpose()
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> StorageResult<()> {
        // Precondition
        assert!(item.contains_key(PARTITION_KEY), "item must carry its partition key");

        let (condition_expression, names) = condition_parts(condition.as_ref());
        self.client()
            .await
            .put_item()
            .table_name(table)
            .set_item(Some(to_attributes(&item)))
            .set_condition_expression(condition_expression)
            .set_expression_attribute_names(names)
            .send()
            .await
            .map_err(|e| classify("put_item", e))?;
        Ok(())
    }

    async fn update_item(
        &self,
        table: &str,
        id: &str,
        patch: Item,
        condition: Option<Condition>,
    ) -> StorageResult<Item> {
        let mut names = HashMap::new();
        let mut values = HashMap::new();
        let mut assignments = Vec::new();
        for (i, (field, value)) in patch.iter().filter(|(k, _)| *k != PARTITION_KEY).enumerate() {
            names.insert(format!("#f{i}"), field.clone());
            values.insert(format!(":v{i}"), to_attribute(value));
            assignments.push(format!("#f{i} = :v{i}"));
        }
        if assignments.is_empty() {
            return Err(StorageError::validation("update needs at least one attribute"));
        }

        let (condition_expression, condition_names) = condition_parts(condition.as_ref());
        names.extend(condition_names.unwrap_or_default());

        let output = self
            .client()
            .await
            .update_item()
            .table_name(table)
            .key(PARTITION_KEY, AttributeValue::S(id.to_string()))
            .update_expression(format!("SET {}", assignments.join(", ")))
            .set_expression_attribute_names(Some(names))
            .set_expression_attribute_values(Some(values))
            .set_condition_expression(condition_expression)
            .return_values(ReturnValue::AllNew)
            .send()
            .await
            .map_err(|e| classify("update_item", e))?;
        match output.attributes() {
            Some(attributes) => from_attributes(attributes),
            None => Err(StorageError::internal("update_item returned no attributes")),
        }
    }

    async fn delete_item(
        &self,
        table: &str,
        id: &str,
        condition: Option<Condition>,
    ) -> StorageResult<Option<Item>> {
        let (condition_expression, names) = condition_parts(condition.as_ref());
        let output = self
            .client()
            .await
            .delete_item()
            .table_name(table)
            .key(PARTITION_KEY, AttributeValue::S(id.to_string()))
            .set_condition_expression(condition_expression)
            .set_expression_attribute_names(names)
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(|e| classify("delete_item", e))?;
        output.attributes().map(from_attributes).transpose()
    }

    async fn query_index(&self, table: &str, query: &IndexQuery) -> StorageResult<Page> {
        let output = self
            .client()
            .await
            .query()
            .table_name(table)
            .index_name(query.index.as_str())
            .key_condition_expression("#pk = :pk")
            .expression_attribute_names("#pk", query.partition_key.as_str())
            .expression_attribute_values(":pk", to_attribute(&query.partition_value))
            .set_exclusive_start_key(decode_cursor(query.start_key.as_deref())?)
            .send()
            .await
            .map_err(|e| classify("query_index", e))?;
        page_from(output.items(), output.last_evaluated_key(), &query.filter)
    }

    async fn scan(
        &self,
        table: &str,
        filter: &Filter,
        start_key: Option<&str>,
    ) -> StorageResult<Page> {
        let output = self
            .client()
            .await
            .scan()
            .table_name(table)
            .set_exclusive_start_key(decode_cursor(start_key)?)
            .send()
            .await
            .map_err(|e| classify("scan", e))?;
        page_from(output.items(), output.last_evaluated_key(), filter)
    }

    async fn batch_write(&self, table: &str, items: Vec<Item>) -> StorageResult<Vec<Item>> {
        if items.len() > DISTRIBUTED_BATCH_ITEMS_COUNT_MAX {
            return Err(StorageError::validation(format!(
                "batch of {} items exceeds the limit of {DISTRIBUTED_BATCH_ITEMS_COUNT_MAX}",
                items.len()
            )));
        }

        let requests = items
            .iter()
            .map(|item| {
                PutRequest::builder()
                    .set_item(Some(to_attributes(item)))
                    .build()
                    .map(|put| WriteRequest::builder().put_request(put).build())
                    .map_err(|e| StorageError::validation(format!("invalid batch item: {e}")))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let output = self
            .client()
            .await
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(|e| classify("batch_write", e))?;

        let mut unprocessed = Vec::new();
        if let Some(pending) = output.unprocessed_items().and_then(|m| m.get(table)) {
            for request in pending {
                if let Some(put) = request.put_request() {
                    unprocessed.push(from_attributes(put.item())?);
                }
            }
        }
        Ok(unprocessed)
    }
}

// =============================================================================
// Expressions
// =============================================================================

fn condition_parts(
    condition: Option<&Condition>,
) -> (Option<String>, Option<HashMap<String, String>>) {
    let Some(condition) = condition else {
        return (None, None);
    };
    let (expression, attr) = match condition {
        Condition::AttributeExists(attr) => ("attribute_exists(#cond)", attr),
        Condition::AttributeNotExists(attr) => ("attribute_not_exists(#cond)", attr),
    };
    let names = HashMap::from([("#cond".to_string(), attr.clone())]);
    (Some(expression.to_string()), Some(names))
}

fn page_from(
    items: &[AttributeMap],
    last_evaluated_key: Option<&AttributeMap>,
    filter: &Filter,
) -> StorageResult<Page> {
    let mut page = Page::default();
    for raw in items {
        let item = from_attributes(raw)?;
        if filter.matches_item(&item) {
            page.items.push(item);
        }
    }
    page.last_evaluated_key = encode_cursor(last_evaluated_key)?;
    Ok(page)
}

fn encode_cursor(key: Option<&AttributeMap>) -> StorageResult<Option<String>> {
    key.filter(|k| !k.is_empty())
        .map(|k| from_attributes(k).map(|item| Value::Object(item).to_string()))
        .transpose()
}

fn decode_cursor(cursor: Option<&str>) -> StorageResult<Option<AttributeMap>> {
    cursor
        .map(|raw| match serde_json::from_str::<Value>(raw)? {
            Value::Object(key) => Ok(to_attributes(&key)),
            _ => Err(StorageError::validation(format!("malformed start key {raw}"))),
        })
        .transpose()
}

// =============================================================================
// Attribute Conversion
// =============================================================================

fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(values) => AttributeValue::L(values.iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(to_attributes(map)),
    }
}

fn to_attributes(item: &Item) -> AttributeMap {
    item.iter()
        .map(|(k, v)| (k.clone(), to_attribute(v)))
        .collect()
}

fn from_attribute(value: &AttributeValue) -> StorageResult<Value> {
    Ok(match value {
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => parse_number(n)?,
        AttributeValue::L(values) => Value::Array(
            values
                .iter()
                .map(from_attribute)
                .collect::<StorageResult<_>>()?,
        ),
        AttributeValue::M(map) => Value::Object(from_attributes(map)?),
        AttributeValue::Ss(values) => {
            Value::Array(values.iter().cloned().map(Value::String).collect())
        }
        AttributeValue::Ns(values) => Value::Array(
            values
                .iter()
                .map(|n| parse_number(n))
                .collect::<StorageResult<_>>()?,
        ),
        _ => {
            return Err(StorageError::serialization(
                "binary attributes are not supported",
            ))
        }
    })
}

fn from_attributes(map: &AttributeMap) -> StorageResult<Item> {
    map.iter()
        .map(|(k, v)| from_attribute(v).map(|value| (k.clone(), value)))
        .collect()
}

fn parse_number(raw: &str) -> StorageResult<Value> {
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::from(i));
    }
    if let Ok(u) = raw.parse::<u64>() {
        return Ok(Value::from(u));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| StorageError::serialization(format!("number {raw} out of range")))
}

// =============================================================================
// Error Classification
// =============================================================================

fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = format!("{operation}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) => StorageError::timeout(message),
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::connection(message)
        }
        _ => classify_code(err.code(), message),
    }
}

fn classify_code(code: Option<&str>, message: String) -> StorageError {
    match code {
        Some(
            "ProvisionedThroughputExceededException"
            | "ThrottlingException"
            | "RequestLimitExceeded"
            | "ItemCollectionSizeLimitExceededException",
        ) => StorageError::throttled(message),
        Some("ServiceUnavailable" | "InternalServerError") => {
            StorageError::transient(TransientKind::ServiceUnavailable, message)
        }
        Some("ConditionalCheckFailedException") => StorageError::conditional_check_failed(message),
        Some("ValidationException" | "SerializationException") => {
            StorageError::validation(message)
        }
        _ => StorageError::permanent(message),
    }
}
