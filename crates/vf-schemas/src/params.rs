//! Closed tagged union of operation parameters.
//!
//! The JSON wire form is `{"type": "<op-type>", ...fields}` and is stored
//! verbatim in the `parameters` jsonb column. Validation happens once, at
//! submission time, before any transaction is opened.

use serde::{Deserialize, Serialize};

use crate::OperationType;

/// Formats the transcoder can produce for video containers.
pub const VIDEO_FORMATS: [&str; 4] = ["mp4", "webm", "mov", "mkv"];
/// Formats the image pipeline can produce.
pub const IMAGE_FORMATS: [&str; 4] = ["jpeg", "png", "webp", "avif"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OperationParameters {
    Resize {
        width: u32,
        height: u32,
    },
    Convert {
        format: String,
    },
    Crop {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    ResizeImage {
        width: u32,
        height: u32,
    },
    ConvertImage {
        format: String,
    },
}

/// Validation failure. Maps to the caller's 4xx; nothing has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamError(pub String);

impl std::fmt::Display for ParamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParamError {}

impl OperationParameters {
    /// The operation type this parameter set belongs to.
    pub fn op_type(&self) -> OperationType {
        match self {
            OperationParameters::Resize { .. } => OperationType::Resize,
            OperationParameters::Convert { .. } => OperationType::Convert,
            OperationParameters::Crop { .. } => OperationType::Crop,
            OperationParameters::ResizeImage { .. } => OperationType::ResizeImage,
            OperationParameters::ConvertImage { .. } => OperationType::ConvertImage,
        }
    }

    /// Domain validation, run before submission opens a transaction.
    ///
    /// `source_format` / `source_dims` describe the asset being transformed;
    /// dims are `(width, height)` when known.
    pub fn validate(
        &self,
        source_format: &str,
        source_dims: Option<(u32, u32)>,
    ) -> Result<(), ParamError> {
        match self {
            OperationParameters::Resize { width, height }
            | OperationParameters::ResizeImage { width, height } => {
                if *width == 0 || *height == 0 {
                    return Err(ParamError(format!(
                        "resize dimensions must be positive, got {width}x{height}"
                    )));
                }
                if *width > 7680 || *height > 4320 {
                    return Err(ParamError(format!(
                        "resize dimensions exceed 8K bound: {width}x{height}"
                    )));
                }
                Ok(())
            }
            OperationParameters::Convert { format } => {
                validate_format(format, &VIDEO_FORMATS)?;
                if format.eq_ignore_ascii_case(source_format) {
                    return Err(ParamError(format!(
                        "conversion to the same format ({format}) is a no-op"
                    )));
                }
                Ok(())
            }
            OperationParameters::ConvertImage { format } => {
                validate_format(format, &IMAGE_FORMATS)?;
                if format.eq_ignore_ascii_case(source_format) {
                    return Err(ParamError(format!(
                        "conversion to the same format ({format}) is a no-op"
                    )));
                }
                Ok(())
            }
            OperationParameters::Crop {
                x,
                y,
                width,
                height,
            } => {
                if *width == 0 || *height == 0 {
                    return Err(ParamError(format!(
                        "crop dimensions must be positive, got {width}x{height}"
                    )));
                }
                if let Some((src_w, src_h)) = source_dims {
                    let fits = x
                        .checked_add(*width)
                        .is_some_and(|right| right <= src_w)
                        && y.checked_add(*height).is_some_and(|bottom| bottom <= src_h);
                    if !fits {
                        return Err(ParamError(format!(
                            "crop region {x},{y} {width}x{height} exceeds source {src_w}x{src_h}"
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Derived output file name (without directory), e.g. `resized_1280x720.mp4`.
    pub fn derived_name(&self, source_format: &str) -> String {
        match self {
            OperationParameters::Resize { width, height } => {
                format!("resized_{width}x{height}.{source_format}")
            }
            OperationParameters::Convert { format } => format!("converted.{format}"),
            OperationParameters::Crop {
                x,
                y,
                width,
                height,
            } => format!("cropped_{x}_{y}_{width}x{height}.{source_format}"),
            OperationParameters::ResizeImage { width, height } => {
                format!("resized_{width}x{height}.{source_format}")
            }
            OperationParameters::ConvertImage { format } => format!("converted.{format}"),
        }
    }
}

fn validate_format(format: &str, allowed: &[&str]) -> Result<(), ParamError> {
    if allowed.iter().any(|f| format.eq_ignore_ascii_case(f)) {
        Ok(())
    } else {
        Err(ParamError(format!(
            "unsupported target format '{format}' (expected one of: {})",
            allowed.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tag_matches_operation_type() {
        let p = OperationParameters::Resize {
            width: 1280,
            height: 720,
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "resize");
        assert_eq!(p.op_type().as_str(), "resize");

        let p = OperationParameters::ConvertImage {
            format: "webp".into(),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "convert-image");
    }

    #[test]
    fn zero_dimension_resize_rejected() {
        let p = OperationParameters::Resize {
            width: 0,
            height: 720,
        };
        assert!(p.validate("mp4", None).is_err());
    }

    #[test]
    fn same_format_convert_rejected() {
        let p = OperationParameters::Convert {
            format: "mp4".into(),
        };
        let err = p.validate("mp4", None).unwrap_err();
        assert!(err.0.contains("no-op"));
    }

    #[test]
    fn unknown_format_rejected() {
        let p = OperationParameters::Convert {
            format: "exe".into(),
        };
        assert!(p.validate("mp4", None).is_err());
    }

    #[test]
    fn crop_out_of_bounds_rejected() {
        let p = OperationParameters::Crop {
            x: 1800,
            y: 0,
            width: 200,
            height: 100,
        };
        assert!(p.validate("mp4", Some((1920, 1080))).is_err());

        let ok = OperationParameters::Crop {
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
        };
        assert!(ok.validate("mp4", Some((1920, 1080))).is_ok());
    }

    #[test]
    fn crop_offset_overflow_rejected() {
        let p = OperationParameters::Crop {
            x: u32::MAX,
            y: 0,
            width: 2,
            height: 2,
        };
        assert!(p.validate("mp4", Some((1920, 1080))).is_err());
    }

    #[test]
    fn derived_names_are_stable() {
        let p = OperationParameters::Resize {
            width: 1280,
            height: 720,
        };
        assert_eq!(p.derived_name("mp4"), "resized_1280x720.mp4");
    }
}
