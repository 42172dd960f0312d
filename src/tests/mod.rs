//! Cross-module scenario tests exercising the full intake → queue → pool →
//! session → bus path with real (shell-stubbed) agent subprocesses.

mod test_helpers;
