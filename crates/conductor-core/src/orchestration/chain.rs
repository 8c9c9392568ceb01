use crate::models::{Job, TaskId, TaskKind};
use crate::orchestration::task::{LiveTask, Task};

/// Builds the task chain of one job run: scan, every configured script in
/// order, then index. Each task depends on the one before it.
pub fn build_chain(job: &Job) -> Vec<Task> {
    let mut chain: Vec<Task> = Vec::with_capacity(job.user_scripts.len() + 2);

    chain.push(new_task(job, TaskKind::Scan, None));

    for script in &job.user_scripts {
        let previous = chain.last().map(|task| task.id());
        chain.push(new_task(
            job,
            TaskKind::Script {
                script: script.clone(),
            },
            previous,
        ));
    }

    let previous = chain.last().map(|task| task.id());
    chain.push(new_task(job, TaskKind::Index, previous));

    chain
}

pub fn script_task(job: &Job, script: &str) -> Task {
    new_task(
        job,
        TaskKind::Script {
            script: script.to_string(),
        },
        None,
    )
}

fn new_task(job: &Job, kind: TaskKind, depends_on: Option<TaskId>) -> Task {
    let task = LiveTask::new(job.name.clone(), kind).with_log_retention(job.keep_last_logs);
    match depends_on {
        Some(predecessor) => task.depending_on(predecessor).into_task(),
        None => task.into_task(),
    }
}
