//! The silex x86 frontend: instruction tables, the byte decoder, and the
//! opcode dispatcher that lowers decoded guest instructions into IR.
//!
//! The pipeline one translated region takes through this crate:
//!
//! 1. [`decoder::Decoder::decode_region`] walks guest bytes breadth-first
//!    from an entry RIP, producing [`decoder::DecodedBlocks`].
//! 2. [`dispatcher::translate_region`] lowers each decoded block into IR,
//!    tracking guest flags lazily and resolving intra-region branches to
//!    block nodes (everything else becomes an `ExitFunction`).

pub mod decoder;
pub mod dispatcher;
pub mod tables;

pub use decoder::{
    DecodeError, DecodedBlock, DecodedBlocks, DecodedInst, DecodedOperand, Decoder, InstStream,
    MemOperand, RawMemoryStream, SliceStream,
};
pub use dispatcher::{translate_region, DispatchError, OpDispatchBuilder, TranslationConfig};
pub use tables::{tables, ImmKind, InstFlags, InstType, X86InstInfo, X86Tables};
