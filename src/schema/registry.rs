//! Schema registry: classify text against known schemas, then extract fields.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::SchemaError;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::schema::model::{FieldDef, FieldType, Schema, builtin_schemas, parse_schemas};
use crate::schema::normalize::{normalize_table, salvage_json};

/// Weight of one keyword hit relative to one field-name hit.
const KEYWORD_WEIGHT: usize = 5;

const EXTRACTION_SYSTEM: &str = "You turn Markdown transcriptions of business documents into \
JSON. Answer with a single JSON object and nothing else.";

/// Document classification and field extraction.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Id of the schema that best fits `text`.
    async fn classify(&self, text: &str) -> Result<String, SchemaError>;

    /// Field values of `text` according to schema `schema_id`.
    ///
    /// Either every required field is present and well-shaped, or the call
    /// fails; a partially valid mapping is never returned.
    async fn extract_fields(
        &self,
        text: &str,
        schema_id: &str,
    ) -> Result<Map<String, Value>, SchemaError>;
}

/// Classification score of `schema` for `text`.
///
/// `KEYWORD_WEIGHT` per hint keyword found plus one per field name found.
pub fn score(schema: &Schema, text: &str) -> usize {
    let haystack = text.to_lowercase();
    let keyword_hits = schema
        .hints
        .keywords
        .iter()
        .filter(|k| !k.trim().is_empty() && haystack.contains(&k.to_lowercase()))
        .count();
    let field_hits = schema
        .fields
        .iter()
        .filter(|f| {
            let name = f.name.to_lowercase();
            haystack.contains(&name) || haystack.contains(&name.replace('_', " "))
        })
        .count();
    keyword_hits * KEYWORD_WEIGHT + field_hits
}

/// Shape the model's raw mapping into the schema: match keys, normalize
/// tables, apply defaults, then validate.
pub fn conform(schema: &Schema, raw: Map<String, Value>) -> Result<Map<String, Value>, SchemaError> {
    let mut matched: Map<String, Value> = Map::new();
    for (key, value) in raw {
        match schema.field(&key) {
            Some(field) => {
                matched.insert(field.name.clone(), value);
            }
            None => tracing::debug!(schema = %schema.id, key = %key, "Dropping unknown field"),
        }
    }

    let mut out = Map::new();
    let mut invalid = Vec::new();
    for field in &schema.fields {
        let mut value = matched.remove(&field.name).unwrap_or(Value::Null);
        if field.field_type.is_structured() {
            value = normalize_table(value);
        }
        if is_blank(&value)
            && let Some(default) = &field.default
        {
            value = default.clone();
        }

        if field.required && is_blank(&value) {
            invalid.push(field.name.clone());
        } else if !shape_ok(field, &value) {
            invalid.push(format!("{} (expected {:?})", field.name, field.field_type));
        }
        out.insert(field.name.clone(), value);
    }

    if invalid.is_empty() {
        Ok(out)
    } else {
        Err(SchemaError::MissingFields(invalid))
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn shape_ok(field: &FieldDef, value: &Value) -> bool {
    match field.field_type {
        _ if value.is_null() => true,
        FieldType::Array => value.is_array(),
        // Object fields may hold a table once normalized
        FieldType::Object => value.is_object() || value.is_array(),
        _ => true,
    }
}

fn extraction_prompt(schema: &Schema, text: &str) -> String {
    let mut fields = String::new();
    for (i, field) in schema.fields.iter().enumerate() {
        let required = if field.required { ", required" } else { "" };
        let type_name = serde_json::to_value(field.field_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        fields.push_str(&format!(
            "{}. {} ({type_name}{required}): {}\n",
            i + 1,
            field.name,
            if field.description.is_empty() {
                "no description"
            } else {
                &field.description
            }
        ));
    }

    format!(
        "Extract the following fields from the document below.\n\n\
FIELDS:\n{fields}\n\
CONVENTIONS IN THE DOCUMENT:\n\
- Pages start with '## Page N'\n\
- Checkboxes: [x] checked, [ ] unchecked\n\
- Radio buttons: (•) selected, ( ) unselected\n\
- Tables use Markdown pipes\n\n\
RULES:\n\
- Use the exact field names above as JSON keys\n\
- For checkboxes and radio buttons return the selected option text\n\
- Return array fields as arrays of row objects\n\
- Use null for anything not present in the document\n\n\
DOCUMENT:\n{text}\n"
    )
}

/// Registry over an in-memory schema list, extracting through a text LLM.
pub struct LlmSchemaRegistry {
    schemas: Vec<Schema>,
    llm: Arc<dyn LlmProvider>,
}

impl LlmSchemaRegistry {
    pub fn new(schemas: Vec<Schema>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { schemas, llm }
    }

    /// Registry over the shipped schemas.
    pub fn builtin(llm: Arc<dyn LlmProvider>) -> Result<Self, SchemaError> {
        Ok(Self::new(builtin_schemas()?, llm))
    }

    /// Registry over schemas defined in a JSON file.
    pub fn from_file(path: &Path, llm: Arc<dyn LlmProvider>) -> Result<Self, SchemaError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| SchemaError::Definition(format!("{}: {e}", path.display())))?;
        let schemas = parse_schemas(&json)?;
        tracing::info!(path = %path.display(), count = schemas.len(), "Loaded schema definitions");
        Ok(Self::new(schemas, llm))
    }

    pub fn schemas(&self) -> &[Schema] {
        &self.schemas
    }

    fn schema(&self, id: &str) -> Result<&Schema, SchemaError> {
        self.schemas
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| SchemaError::UnknownSchema(id.to_string()))
    }
}

#[async_trait]
impl SchemaRegistry for LlmSchemaRegistry {
    async fn classify(&self, text: &str) -> Result<String, SchemaError> {
        let mut best: Option<(&Schema, usize)> = None;
        for schema in &self.schemas {
            let s = score(schema, text);
            tracing::debug!(schema = %schema.id, score = s, "Schema score");
            if best.is_none_or(|(_, top)| s > top) {
                best = Some((schema, s));
            }
        }

        match best {
            Some((schema, s)) if s > 0 => Ok(schema.id.clone()),
            _ => self
                .schemas
                .iter()
                .find(|s| s.hints.fallback)
                .map(|s| s.id.clone())
                .ok_or(SchemaError::NoMatch),
        }
    }

    async fn extract_fields(
        &self,
        text: &str,
        schema_id: &str,
    ) -> Result<Map<String, Value>, SchemaError> {
        let schema = self.schema(schema_id)?;
        let request = CompletionRequest::new(EXTRACTION_SYSTEM, extraction_prompt(schema, text))
            .with_temperature(0.0)
            .with_max_tokens(8192);

        let response = self.llm.complete(request).await?;
        let raw = salvage_json(&response).ok_or(SchemaError::NoJson)?;
        conform(schema, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replies with a canned response and records prompts.
    struct CannedLlm {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedLlm {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for CannedLlm {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(request.prompt);
            Ok(self.reply.clone())
        }
    }

    fn invoice_schema() -> Schema {
        parse_schemas(
            r#"[{"id":"invoice","name":"Invoice","fields":[
                {"name":"amount","required":true,"type":"currency"},
                {"name":"date","required":true,"type":"date"},
                {"name":"lines","type":"array"},
                {"name":"currency","default":"INR"}],
              "hints":{"keywords":["invoice"]}}]"#,
        )
        .unwrap()
        .remove(0)
    }

    #[tokio::test]
    async fn classify_prefers_keyword_hits() {
        let registry = LlmSchemaRegistry::builtin(CannedLlm::new("{}")).unwrap();
        let text = "## Page 1\n\nSite Information\nCooling water available: (•) Yes ( ) No\nGearbox make preferred: SEW";
        assert_eq!(registry.classify(text).await.unwrap(), "client_site_information");

        let text = "Kind Attn: Mr. Rao\nEnquiry No: 55\nGrand Total: 1,20,000";
        assert_eq!(registry.classify(text).await.unwrap(), "supplier_quotation");
    }

    #[tokio::test]
    async fn classify_falls_back_when_nothing_scores() {
        let registry = LlmSchemaRegistry::builtin(CannedLlm::new("{}")).unwrap();
        assert_eq!(
            registry.classify("lorem ipsum").await.unwrap(),
            "general_quotation"
        );
    }

    #[tokio::test]
    async fn classify_without_fallback_is_no_match() {
        let registry = LlmSchemaRegistry::new(vec![invoice_schema()], CannedLlm::new("{}"));
        assert!(matches!(
            registry.classify("lorem ipsum").await,
            Err(SchemaError::NoMatch)
        ));
    }

    #[test]
    fn score_counts_keywords_and_field_names() {
        let schema = invoice_schema();
        // "invoice" keyword + "amount" and "date" field names
        assert_eq!(score(&schema, "INVOICE\nAmount: 100\nDate: 2025-01-01"), 7);
        assert_eq!(score(&schema, "nothing relevant"), 0);
    }

    #[tokio::test]
    async fn extract_fields_maps_keys_and_applies_defaults() {
        let llm = CannedLlm::new(
            "```json\n{\"Amount\": \"100\", \"DATE\": \"2025-01-01\", \"colour\": \"red\"}\n```",
        );
        let registry = LlmSchemaRegistry::new(vec![invoice_schema()], llm.clone());

        let fields = registry
            .extract_fields("Invoice text", "invoice")
            .await
            .unwrap();
        assert_eq!(fields["amount"], "100");
        assert_eq!(fields["date"], "2025-01-01");
        assert_eq!(fields["currency"], "INR");
        assert_eq!(fields["lines"], Value::Null);
        assert!(!fields.contains_key("colour"));

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].contains("amount (currency, required)"));
        assert!(prompts[0].contains("Invoice text"));
    }

    #[tokio::test]
    async fn extract_fields_rejects_missing_required() {
        let registry = LlmSchemaRegistry::new(
            vec![invoice_schema()],
            CannedLlm::new(r#"{"amount": "100", "date": null}"#),
        );
        match registry.extract_fields("text", "invoice").await {
            Err(SchemaError::MissingFields(fields)) => assert_eq!(fields, vec!["date".to_string()]),
            other => panic!("expected missing fields, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn extract_fields_without_json_fails() {
        let registry =
            LlmSchemaRegistry::new(vec![invoice_schema()], CannedLlm::new("I cannot help."));
        assert!(matches!(
            registry.extract_fields("text", "invoice").await,
            Err(SchemaError::NoJson)
        ));
    }

    #[tokio::test]
    async fn extract_fields_unknown_schema() {
        let registry = LlmSchemaRegistry::new(vec![invoice_schema()], CannedLlm::new("{}"));
        assert!(matches!(
            registry.extract_fields("text", "receipt").await,
            Err(SchemaError::UnknownSchema(_))
        ));
    }

    #[test]
    fn conform_normalizes_tables_and_checks_shape() {
        let schema = invoice_schema();
        let raw = json!({
            "amount": "100",
            "date": "2025-01-01",
            "lines": {"1": {"item": "shaft"}, "2": {"item": null}}
        });
        let fields = conform(&schema, raw.as_object().unwrap().clone()).unwrap();
        assert_eq!(fields["lines"], json!([{"item": "shaft"}]));

        let raw = json!({"amount": "100", "date": "2025-01-01", "lines": "shaft x1"});
        match conform(&schema, raw.as_object().unwrap().clone()) {
            Err(SchemaError::MissingFields(fields)) => assert!(fields[0].starts_with("lines")),
            other => panic!("expected shape failure, got {other:?}"),
        }
    }
}
