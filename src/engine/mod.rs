//! Process engine.
//!
//! Deploys processes, creates and runs process instances and modifies
//! running ones. Everything here is a set of [`TypedRecordProcessor`]s and
//! event appliers installed into a [`StreamProcessor`]; the engine keeps no
//! state outside the processor's [`Db`](crate::state::Db).
//!
//! Supported commands:
//! - `DEPLOYMENT:CREATE`
//! - `PROCESS_INSTANCE_CREATION:CREATE`
//! - `PROCESS_INSTANCE:ACTIVATE_ELEMENT`, `COMPLETE_ELEMENT`,
//!   `TERMINATE_ELEMENT`, `CANCEL`
//! - `PROCESS_INSTANCE_MODIFICATION:MODIFY`
//!
//! [`TypedRecordProcessor`]: crate::stream::TypedRecordProcessor

mod appliers;
mod behavior;
mod migrations;
pub mod model;
mod modification;
mod processors;
pub mod state;

use std::sync::Arc;

pub use migrations::ElementInstanceChildIndexMigration;

use crate::dispatcher::Dispatcher;
use crate::protocol::{Intent, ValueType};
use crate::state::migration::{DbMigrator, MigrationTask};
use crate::stream::{EventAppliers, RecordProcessors, StreamProcessor, StreamProcessorBuilder};
use behavior::ProcessCache;
use modification::ProcessInstanceModificationProcessor;
use processors::{
    ActivateElementProcessor, CancelProcessInstanceProcessor, CompleteElementProcessor,
    CreateProcessInstanceProcessor, DeploymentCreateProcessor, TerminateElementProcessor,
};

/// Install the engine's command processors and event appliers.
pub fn register(processors: &mut RecordProcessors, appliers: &mut EventAppliers) {
    let processes = Arc::new(ProcessCache::default());

    processors
        .on_command(ValueType::Deployment, Intent::Create, Arc::new(DeploymentCreateProcessor))
        .on_command(
            ValueType::ProcessInstanceCreation,
            Intent::Create,
            Arc::new(CreateProcessInstanceProcessor::new(Arc::clone(&processes))),
        )
        .on_command(
            ValueType::ProcessInstance,
            Intent::ActivateElement,
            Arc::new(ActivateElementProcessor::new(Arc::clone(&processes))),
        )
        .on_command(
            ValueType::ProcessInstance,
            Intent::CompleteElement,
            Arc::new(CompleteElementProcessor::new(Arc::clone(&processes))),
        )
        .on_command(
            ValueType::ProcessInstance,
            Intent::TerminateElement,
            Arc::new(TerminateElementProcessor),
        )
        .on_command(
            ValueType::ProcessInstance,
            Intent::Cancel,
            Arc::new(CancelProcessInstanceProcessor),
        )
        .on_command(
            ValueType::ProcessInstanceModification,
            Intent::Modify,
            Arc::new(ProcessInstanceModificationProcessor::new(processes)),
        );

    appliers::register(appliers);
}

/// Migrations the engine's state layout needs, in order.
pub fn migrations() -> Vec<Box<dyn MigrationTask>> {
    vec![Box::new(ElementInstanceChildIndexMigration)]
}

/// A stream processor builder with the engine installed.
pub fn stream_processor(dispatcher: Arc<Dispatcher>) -> StreamProcessorBuilder {
    let mut processors = RecordProcessors::new();
    let mut appliers = EventAppliers::new();
    register(&mut processors, &mut appliers);

    StreamProcessor::builder(dispatcher)
        .name("engine")
        .processors(processors)
        .appliers(appliers)
        .migrator(DbMigrator::new(migrations()))
}

#[cfg(test)]
mod tests;
