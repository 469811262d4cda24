use thiserror::Error;

/// Errors surfaced by the quantization API.
///
/// Setters and constructors reject bad values without changing any state;
/// `quantize` fails without leaving partial results behind.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("{0} is outside the accepted range")]
    ValueOutOfRange(&'static str),

    #[error("output buffer holds {len} bytes but {required} are required")]
    BufferTooSmall { len: usize, required: usize },

    #[error("not enough memory to build the color histogram")]
    OutOfMemory,

    #[error("remapping error exceeded the configured minimum quality")]
    QualityTooLow,
}
