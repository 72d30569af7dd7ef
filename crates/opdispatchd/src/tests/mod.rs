//! Test suites that exercise the dispatcher, server and workers together.

mod dispatcher_behaviour;
mod end_to_end;
mod support;
