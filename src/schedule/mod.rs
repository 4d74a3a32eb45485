pub mod alias;
pub mod buffer;
pub mod dump;
pub mod liveness;
pub mod options;
pub mod scheduler;
pub mod targets;
pub mod union_find;

pub use alias::{AliasDecision, AliasMotionAnalyzer, AliasReport, DeclineReason};
pub use buffer::{
    BufferArena,
    Lifetime,
    LogicalBuffer,
    LogicalBufferId,
    PhysicalBuffer,
    PhysicalBufferId,
    ViewDescriptor,
};
pub use dump::{to_json, to_text, write_dump, DumpFormat};
pub use liveness::{record_liveness, CalleeLiveness, LivenessRecord, LivenessRecorder};
pub use options::ScheduleOptions;
pub use scheduler::{
    allocate,
    assign,
    fix_lifetimes,
    form_physical_buffers,
    verify_no_overlap,
    BufferAssignment,
    BufferScheduler,
    CalleeSchedule,
    ScheduleStage,
    ScheduledInstruction,
    SubgraphSchedule,
};
pub use targets::{schedule_target, schedule_targets, ModelSchedule, TargetSchedule, TargetSubgraphs};
pub use union_find::UnionFind;
