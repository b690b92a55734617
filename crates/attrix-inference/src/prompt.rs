//! Schema-derived instructions sent alongside each image.

use std::fmt::Write;

use attrix_core::defaults::IMAGE_QUALITY_CODE;
use attrix_core::{AttributeType, SchemaItem};

/// Render the system instructions for one schema snapshot.
///
/// One line per attribute (key, label, type, requiredness, allowed values)
/// followed by the response contract the validator enforces.
pub fn build_instructions(schema: &[SchemaItem]) -> String {
    let mut out = String::from(
        "You are a product catalogue assistant. Inspect the image and fill in \
         every attribute listed below.\n\nAttributes:\n",
    );

    for item in schema {
        let _ = write!(out, "- {} ({}): {}", item.key, item.label, item.attribute_type);
        if item.required {
            out.push_str(", required");
        }
        if item.attribute_type == AttributeType::Select && !item.allowed_values.is_empty() {
            let _ = write!(out, "; allowed values: {}", item.allowed_values.join(" | "));
        }
        out.push('\n');
    }

    let _ = write!(
        out,
        "\nRespond with a single JSON object with exactly one entry per attribute key. \
         Each entry is null when the attribute is not visible, otherwise an object with:\n\
         - \"rawValue\": what you literally see (string)\n\
         - \"schemaValue\": the value to store; for select attributes the closest allowed value\n\
         - \"isNewDiscovery\": true when no allowed value is an acceptable match\n\
         - \"visualConfidence\" and \"mappingConfidence\": integers 0-100\n\
         - \"reasoning\": one short sentence\n\
         \nIf the image is too blurry, dark, or cropped to judge, respond instead with \
         {{\"error\": \"{}\", \"reason\": \"<why>\"}}.",
        IMAGE_QUALITY_CODE
    );

    out
}
