pub(crate) mod async_task;
