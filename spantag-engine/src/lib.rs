pub mod bilou;
pub mod classifier;
pub mod codec;
pub mod entity_map;
pub mod features;
pub mod recognizer;
pub mod sentence;
pub mod tagger;
pub mod trainer;

pub use bilou::{BilouTag, ENTITY_UNKNOWN, EntityId};
pub use classifier::{NetworkClassifier, NetworkParameters};
pub use codec::CodecError;
pub use entity_map::EntityMap;
pub use features::FeatureTemplates;
pub use recognizer::{ModelVariant, Recognizer};
pub use sentence::{NamedEntity, Sentence, TaggedWord};
pub use tagger::{ExternalTagger, Tagger, TaggerKind, Tokenizer, TrivialTagger, WhitespaceTokenizer};
