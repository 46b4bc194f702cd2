//! System prompts for the flyer pipeline's generation steps.

pub const PLANNER: &str = "You're a professional flyer designer. Create a detailed plan including:
1. Target audience analysis
2. Color scheme recommendations
3. Imagery requirements
4. Text tone and style
5. Layout suggestions";

pub const IMAGE_PROMPT: &str =
    "Create a detailed image generation prompt for flyer imagery based on the design plan";

pub const TEXT_ELEMENTS: &str = "Generate flyer text elements:
- Catchy headline (max 8 words)
- Persuasive subtext (max 20 words)
- Optimal text position (top-left, top-center, center, bottom-center)
Return JSON format with keys: headline, subtext, position";

/// Reviewer feedback appended to a regeneration request.
pub fn revision_note(artifact: &str, previous: Option<&str>, feedback: &str) -> String {
    match previous {
        Some(prev) => format!(
            "The previous {artifact} was rejected by the reviewer.\nPrevious {artifact}: {prev}\nReviewer feedback: {feedback}\nRevise accordingly."
        ),
        None => format!(
            "The previous {artifact} was rejected by the reviewer.\nReviewer feedback: {feedback}\nRevise accordingly."
        ),
    }
}
