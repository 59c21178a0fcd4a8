//! Test utilities for the state engine.
