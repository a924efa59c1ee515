//! Prompt construction for a single finding

use super::ElaborationRequest;

/// Longest answer the model is asked for
pub const MAX_WORDS: usize = 150;

pub fn build_prompt(request: &ElaborationRequest) -> String {
    let mut prompt = String::new();

    prompt.push_str("You are reviewing a code search result for a developer.\n");
    prompt.push_str(&format!(
        "File: {}\nLine: {}\n\n",
        request.file_path.display(),
        request.line_number
    ));

    prompt.push_str("The matched snippet (the hit is wrapped in >>> <<<):\n");
    prompt.push_str("<snippet>\n");
    prompt.push_str(request.snippet.trim_end());
    prompt.push_str("\n</snippet>\n\n");

    if let Some(context) = &request.wider_context {
        prompt.push_str("Surrounding lines from the file (the matched line starts with >>):\n");
        prompt.push_str("<file-context>\n");
        prompt.push_str(context.trim_end());
        prompt.push_str("\n</file-context>\n\n");
    }

    prompt.push_str(&format!(
        "Explain this code in 2-4 sentences and no more than {} words. Cover:\n",
        MAX_WORDS
    ));
    prompt.push_str("1. What the code does and what it is responsible for.\n");
    prompt.push_str("2. Implications or considerations a developer should keep in mind here.\n");
    prompt.push_str("3. An improvement, only if one is obvious and clearly relevant.\n");
    prompt.push_str("Do not restate the code. Quote at most a few tokens when you need to point at something.");

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelParams;
    use std::path::PathBuf;

    fn request(wider_context: Option<&str>) -> ElaborationRequest {
        ElaborationRequest {
            file_path: PathBuf::from("/repo/src/lib.rs"),
            line_number: 42,
            match_text: "unsafe".into(),
            snippet: "  42: >>> unsafe <<< { ptr.read() }".into(),
            wider_context: wider_context.map(str::to_string),
            params: ModelParams {
                provider: "gemini".into(),
                model: "gemini-2.5-flash".into(),
                api_base: None,
            },
        }
    }

    #[test]
    fn test_prompt_embeds_snippet_and_location() {
        let prompt = build_prompt(&request(None));
        assert!(prompt.contains("File: /repo/src/lib.rs"));
        assert!(prompt.contains("Line: 42"));
        assert!(prompt.contains("<snippet>\n  42: >>> unsafe <<< { ptr.read() }\n</snippet>"));
        assert!(!prompt.contains("<file-context>"));
        assert!(prompt.contains("150 words"));
    }

    #[test]
    fn test_prompt_includes_wider_context_when_present() {
        let prompt = build_prompt(&request(Some(">>   42: unsafe { ptr.read() }")));
        assert!(prompt.contains("<file-context>\n>>   42: unsafe { ptr.read() }\n</file-context>"));
    }
}
