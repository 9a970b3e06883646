// Copyright (c) Spindle Contributors.
// Licensed under the MIT license OR Apache 2.0

pub mod stream;
