//! Image service client: submit a generation request, poll to a final URL.

mod make_api;

pub use make_api::{
    calculate_dimensions, GenerateRequest, ImageApi, ImageApiError, ImageOutput, MakeImageClient,
};
