//! Per-layer update rules of the RWKV block.
//!
//! Each function records graph nodes for a whole `[n_embed, seq_len]` slab of activations and
//! threads the layer's carried state through `&mut` tensor handles. The caller stores the
//! final handles into the output state buffer.
pub mod block;
pub mod channel_mix;
pub mod shift;
pub mod time_mix;
pub mod time_mix_v5;

pub use block::block;
pub use channel_mix::channel_mix;
pub use shift::{carry, mix, Shifted};
pub use time_mix::{time_mix_v4, wkv_step, Accumulators};
pub use time_mix_v5::{time_mix_v5, HeadLayout};
