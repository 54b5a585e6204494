#![recursion_limit = "256"]

pub mod batch;
pub mod config;
pub mod convertor;
pub mod decoder;
pub mod detector;
pub mod encoder;
pub mod error;
pub mod fusion;
pub mod glyph;
pub mod loss;
pub mod model;
pub mod pretrain;
pub mod recurrent;
pub mod streams;

pub use batch::{Batch, BatchBuilder, StreamConvertor, StreamIndex, Tokenizer};
pub use config::{FusionConfig, LossConfig, Preset, StreamKind};
pub use error::{FusionError, Result};
pub use glyph::{
    load_font_list, FontDescriptor, GlyphRenderer, GlyphTable, GlyphTableBuilder, ScriptConverter,
};
pub use model::{SpellFusionModel, SpellOutput};
pub use pretrain::{PretrainConfig, StreamPretrainModel};
