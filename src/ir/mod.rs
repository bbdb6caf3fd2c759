//! IR data model and the three components that turn a propagation update
//! into renderable audio: band-interleaved assembly (§4.B), the discrete
//! path renderer (§4.C), and the convolution engine (§4.A).

pub mod assembler;
pub mod convolver;
pub mod model;
pub mod path_renderer;
