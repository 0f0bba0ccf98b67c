pub mod extract;
pub mod store;

pub use extract::{extract_fields, field_value, infer_type, FieldType};
pub use store::{LogTemplate, TemplateError, TemplateField, TemplateStore};
