//! State record field names used by the flyer pipeline.

/// The user's request.
pub const DESCRIPTION: &str = "description";
pub const PLAN: &str = "plan";
pub const IMAGE_PROMPT: &str = "image_prompt";
/// Image reference (URL) of the latest generated image.
pub const IMAGE: &str = "image";
/// Latest generated text elements, as a JSON object.
pub const TEXT: &str = "text";
pub const FLYER: &str = "flyer";
/// Where the sink stored the composed flyer.
pub const FLYER_LOCATION: &str = "flyer_location";

// Step ids
pub const STEP_PLAN: &str = "plan";
pub const STEP_PLAN_APPROVAL: &str = "plan_approval";
pub const STEP_DISPATCH: &str = "dispatch";
pub const STEP_IMAGE: &str = "image";
pub const STEP_IMAGE_APPROVAL: &str = "image_approval";
pub const STEP_TEXT: &str = "text";
pub const STEP_TEXT_APPROVAL: &str = "text_approval";
pub const STEP_CHECK: &str = "check_approvals";
pub const STEP_COMPOSE: &str = "compose";
