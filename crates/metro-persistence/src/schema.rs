//! Esquema Diesel (mantenido a mano). Reemplazable con `diesel print-schema`.

diesel::table! {
    measurement_programs (id) {
        id -> BigInt,
        name -> Text,
        description -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    measurement_units (id) {
        id -> BigInt,
        name -> Text,
        symbol -> Text,
    }
}

diesel::table! {
    instruments (id) {
        id -> BigInt,
        name -> Text,
        manufacturer -> Text,
        model -> Text,
        serial_number -> Text,
        accuracy -> Double,
        resolution -> Double,
        lower_limit -> Double,
        upper_limit -> Double,
        measurement_unit_id -> BigInt,
        location -> Text,
        calibration_date -> Date,
        verification_date -> Date,
        verification_due_date -> Date,
        notes -> Nullable<Text>,
    }
}

diesel::table! {
    program_steps (id) {
        id -> BigInt,
        program_id -> BigInt,
        step_order -> Integer,
        name -> Text,
        description -> Nullable<Text>,
        lsl -> Double,
        target_value -> Double,
        usl -> Double,
        measurement_unit_id -> BigInt,
        instrument_id -> BigInt,
    }
}

diesel::table! {
    operators (id) {
        id -> BigInt,
        user_id -> Uuid,
        certification_number -> Text,
        certification_date -> Date,
        certification_expiry_date -> Date,
    }
}

diesel::table! {
    measurement_runs (id) {
        id -> BigInt,
        program_id -> BigInt,
        started_at -> Timestamptz,
        finished_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    step_records (id) {
        id -> BigInt,
        measurement_run_id -> BigInt,
        measurement_program_step_id -> BigInt,
        instrument_id -> BigInt,
        operator_id -> BigInt,
        real_value -> Double,
        status -> Text,
        lsl -> Double,
        target_value -> Double,
        usl -> Double,
        measurement_unit_id -> BigInt,
        step_fingerprint -> Text,
    }
}

diesel::joinable!(instruments -> measurement_units (measurement_unit_id));
diesel::joinable!(program_steps -> measurement_programs (program_id));
diesel::joinable!(program_steps -> instruments (instrument_id));
diesel::joinable!(measurement_runs -> measurement_programs (program_id));
diesel::joinable!(step_records -> measurement_runs (measurement_run_id));
diesel::joinable!(step_records -> program_steps (measurement_program_step_id));
diesel::joinable!(step_records -> operators (operator_id));

diesel::allow_tables_to_appear_in_same_query!(
    measurement_programs,
    measurement_units,
    instruments,
    program_steps,
    operators,
    measurement_runs,
    step_records,
);
