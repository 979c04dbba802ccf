//! Detection model, frame/model coordinate mapping, and the classifier
//! contract shared by the strip localizer and the line interpreter.

pub mod classifier;
pub mod detection;
pub mod replay;
pub mod transform;

pub use classifier::{Classifier, ClassifierError, ModelInput};
pub use detection::{BoundingBox, BoxSpace, Detection, best_detection, filter_by_confidence};
pub use replay::ReplayClassifier;
pub use transform::{CoordinateTransform, Rotation, TransformError};
