pub mod intake;
pub mod prompts;
pub mod router;
pub mod specialist;
pub mod summary;

pub use intake::IntakeStage;
pub use router::RouterStage;
pub use specialist::SpecialistStage;
pub use summary::SummaryStage;
