use serde::Serialize;
use serde_json::json;
use tera::{Context, Error as TeraError, Tera};

use crate::models::session::ClientContext;
use crate::models::tool::Tool;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const CLIENT_CONTEXT_TEMPLATE: &str = include_str!("prompts/client_context.md");
const FINALIZE_TEMPLATE: &str = include_str!("prompts/finalize.md");

/// Upper bound on answer length the assistant is asked to respect
pub const MAX_ANSWER_CHARS: usize = 100;

pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    let rendered = tera.render("inline_template", &context)?;
    Ok(rendered)
}

/// Instructions for the decision step, listing the tools on offer
pub fn system_prompt(tools: &[Tool]) -> Result<String, TeraError> {
    load_prompt(
        SYSTEM_TEMPLATE,
        &json!({ "max_chars": MAX_ANSWER_CHARS, "tools": tools }),
    )
}

/// The human message for this turn, preceded by the asker's environment when known
pub fn human_prompt(message: &str, client: Option<&ClientContext>) -> Result<String, TeraError> {
    match client {
        Some(client) => Ok(load_prompt(CLIENT_CONTEXT_TEMPLATE, client)? + message),
        None => Ok(message.to_string()),
    }
}

/// Asks the model to repeat `draft` verbatim so it can be streamed as the answer
pub fn finalize_prompt(draft: &str) -> Result<String, TeraError> {
    load_prompt(FINALIZE_TEMPLATE, &json!({ "content": draft }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_load_prompt() {
        let template = "Hello, {{ name }}! You are {{ age }} years old.";
        let mut context = HashMap::new();
        context.insert("name".to_string(), "Alice".to_string());
        context.insert("age".to_string(), 30.to_string());

        let result = load_prompt(template, &context).unwrap();
        assert_eq!(result, "Hello, Alice! You are 30 years old.");
    }

    #[test]
    fn test_load_prompt_missing_variable() {
        let template = "Hello, {{ name }}! You are {{ age }} years old.";
        let mut context = HashMap::new();
        context.insert("name".to_string(), "Alice".to_string());
        let result = load_prompt(template, &context);
        assert!(result.is_err());
    }

    #[test]
    fn test_system_prompt_lists_tools() {
        let tools = vec![Tool::new(
            "web__search",
            "Search the web",
            serde_json::json!({"type": "object"}),
        )];
        let prompt = system_prompt(&tools).unwrap();
        assert!(prompt.contains("100文字以内"));
        assert!(prompt.contains("## 参考になるサイト"));
        assert!(prompt.contains("- web__search: Search the web"));
    }

    #[test]
    fn test_system_prompt_without_tools() {
        let prompt = system_prompt(&[]).unwrap();
        assert!(!prompt.contains("利用できるツール"));
    }

    #[test]
    fn test_human_prompt_with_client_context() {
        let client = ClientContext {
            os_name: "iOS".into(),
            browser_name: "Safari".into(),
            device_name: "iPhone".into(),
        };
        let prompt = human_prompt("Wi-Fiに繋がりません", Some(&client)).unwrap();
        assert_eq!(
            prompt,
            "# 質問者の情報\n- OS: iOS\n- ブラウザ: Safari\n- デバイス: iPhone\nWi-Fiに繋がりません"
        );
    }

    #[test]
    fn test_human_prompt_without_client_context() {
        assert_eq!(human_prompt("こんにちは", None).unwrap(), "こんにちは");
    }

    #[test]
    fn test_finalize_prompt_wraps_draft() {
        let prompt = finalize_prompt("再起動してください").unwrap();
        assert!(prompt.starts_with("# 指示\n以下の文字列だけを出力してください。\n"));
        assert!(prompt.contains("再起動してください"));
    }
}
