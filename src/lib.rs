pub mod caption_index;
pub mod captioner;
pub mod collage;
pub mod config;
pub mod error;
pub mod frame_extractor;
pub mod fuzzy;
pub mod matcher;
pub mod metadata;
pub mod processor;
pub mod scene_detector;
pub mod video_processor;
pub mod video_query;

pub use caption_index::CaptionIndex;
pub use captioner::{Captioner, MoondreamCaptioner};
pub use collage::{create_collage, CollageOutcome};
pub use config::{ConfigLoader, ConfigOverrides, PipelineConfig};
pub use error::{Result, SceneSearchError};
pub use frame_extractor::extract_scene_frames;
pub use matcher::{complete, unique_completion, vocabulary, QueryMatcher};
pub use metadata::{ExtractionReport, Scene};
pub use processor::{
    ask_video, build_index, ensure_index, search_scenes, AskOutcome, IndexOutcome, IndexSettings,
    IndexSource, SearchOutcome,
};
pub use scene_detector::SceneDetector;
pub use video_processor::{FrameSource, VideoDecoder};
pub use video_query::{GeminiVideoQuery, VideoQueryService};
